//! Error types for the flashing stack.
//!
//! Every failure a workflow can surface is one variant of [`Error`], so
//! callers (CLI, HTTP layer) can match on the kind and log the relevant
//! contextual field.

use thiserror::Error;

use crate::flasher::SessionState;
use crate::kwp2000::Service;

/// Raised by [`crate::bus::FrameBus`] implementations when the underlying
/// driver fails or the link goes down.
#[derive(Debug, Clone, Error)]
#[error("CAN transport error: {0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// FrameBus send/receive failed or timed out.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The ECU never answered a First frame with a FlowControl frame.
    #[error("no FlowControl frame from ECU")]
    NoFlowControl,

    /// A consecutive frame failed to arrive during reassembly.
    #[error("timed out waiting for a consecutive frame")]
    ConsecutiveTimeout,

    /// Missing, truncated, or negative KWP response.
    #[error("{service} failed, response {response:02X?}")]
    Protocol { service: Service, response: Vec<u8> },

    /// Image failed the size or blank check.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// VIN is not exactly 17 ASCII characters.
    #[error("VIN must be exactly 17 ASCII characters")]
    InvalidVin,

    /// No matching VIN in the calibration region.
    #[error("VIN not found in calibration area")]
    VinNotFound,

    /// Post-flash readback differs from the programmed image.
    #[error("verification mismatch at 0x{address:06X}")]
    VerificationMismatch { address: u32 },

    /// Workflow invoked before the session reached the required state.
    #[error("{operation} invoked in {state:?} session state")]
    Session {
        operation: &'static str,
        state: SessionState,
    },

    /// Backup file could not be written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
