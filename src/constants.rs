//! Centralized constants for MSD80/81 flashing over PT-CAN.
//!
//! All protocol identifiers, flash layout figures, and timing parameters
//! used throughout the crate live here.

// ============================================================================
// CAN IDENTIFIERS
// ============================================================================

/// Fixed arbitration ids for the MSD80/81 diagnostic link.
pub mod can_ids {
    /// Tester -> ECU requests.
    pub const TESTER_TO_ECU: u16 = 0x6F1;

    /// ECU -> tester responses. Frames on any other id are ignored.
    pub const ECU_TO_TESTER: u16 = 0x6F9;

    /// PT-CAN bitrate (bit/s).
    pub const BITRATE: u32 = 500_000;
}

// ============================================================================
// KWP2000 SERVICES
// ============================================================================

/// Service identifiers from the KWP2000 subset MSD80/81 exposes.
pub mod services {
    pub const START_DIAGNOSTIC_SESSION: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_ECU_IDENTIFICATION: u8 = 0x1A;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;

    /// Added to a request SID to form the positive response SID.
    pub const POSITIVE_OFFSET: u8 = 0x40;

    /// First byte of every negative response.
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Diagnostic session sub-functions.
pub mod session {
    /// BMW programming session used for flashing.
    pub const PROGRAMMING: u8 = 0x85;
}

/// ECUReset sub-functions.
pub mod reset {
    /// Hard reset (power-on equivalent).
    pub const HARD: u8 = 0x01;
}

/// SecurityAccess sub-functions.
pub mod security {
    pub const REQUEST_SEED: u8 = 0x01;
    pub const SEND_KEY: u8 = 0x02;
}

/// RoutineControl routine identifiers.
pub mod routines {
    /// Erases the entire flash ahead of a download.
    pub const ERASE_ALL: u16 = 0xFF00;
}

/// ReadECUIdentification records.
pub mod ident {
    /// Identification records MSD80/81 discloses in a programming session.
    pub const IDENTIFIERS: &[u8] = &[0x90, 0x92, 0x94, 0x97];
}

// ============================================================================
// FLASH LAYOUT
// ============================================================================

/// MSD80/81 flash geometry. The sector table itself lives in [`crate::image`].
pub mod layout {
    /// Total flash size (1 MiB).
    pub const FLASH_SIZE: usize = 0x10_0000;

    /// Calibration region bounds within the image.
    pub const CAL_START: usize = 0x01_0000;
    pub const CAL_SIZE: usize = 0x04_0000;
    pub const CAL_END: usize = CAL_START + CAL_SIZE;
}

// ============================================================================
// TRANSFER SIZES
// ============================================================================

pub mod transfer {
    /// Default TransferData block size (2 KiB); the ECU's advertised maximum
    /// wins when smaller.
    pub const DEFAULT_BLOCK: usize = 0x0800;

    /// ReadMemoryByAddress stride used by backup and verify.
    pub const READ_CHUNK: usize = 0x0400;
}

// ============================================================================
// TIMING
// ============================================================================

pub mod timing {
    use std::time::Duration;

    /// CAN receive timeout for a single frame.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// TesterPresent cadence during programming. The ECU drops the session
    /// after roughly 5 s of silence; 2 s leaves margin.
    pub const TESTER_PRESENT_INTERVAL: Duration = Duration::from_secs(2);

    /// Grace period when joining the heartbeat thread.
    pub const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
}
