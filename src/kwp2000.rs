//! KWP2000 service client for the MSD80/81 programming session.
//!
//! Builds each service request, runs it through the ISO-TP transport, and
//! validates that the response opens with the positive echo (`SID + 0x40`).
//! Negative responses are decoded for the log but never retried here;
//! callers decide how to react.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::FrameBus;
use crate::constants::{can_ids, security, services, transfer};
use crate::error::{Error, Result};
use crate::isotp::IsoTp;

/// KWP2000 services used by the flashing workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    StartDiagnosticSession,
    EcuReset,
    ReadEcuIdentification,
    ReadMemoryByAddress,
    SecurityAccess,
    RoutineControl,
    RequestDownload,
    TransferData,
    RequestTransferExit,
    TesterPresent,
}

impl Service {
    pub fn sid(self) -> u8 {
        match self {
            Service::StartDiagnosticSession => services::START_DIAGNOSTIC_SESSION,
            Service::EcuReset => services::ECU_RESET,
            Service::ReadEcuIdentification => services::READ_ECU_IDENTIFICATION,
            Service::ReadMemoryByAddress => services::READ_MEMORY_BY_ADDRESS,
            Service::SecurityAccess => services::SECURITY_ACCESS,
            Service::RoutineControl => services::ROUTINE_CONTROL,
            Service::RequestDownload => services::REQUEST_DOWNLOAD,
            Service::TransferData => services::TRANSFER_DATA,
            Service::RequestTransferExit => services::REQUEST_TRANSFER_EXIT,
            Service::TesterPresent => services::TESTER_PRESENT,
        }
    }

    /// Expected first byte of a positive response.
    pub fn positive_sid(self) -> u8 {
        self.sid() + services::POSITIVE_OFFSET
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 16-bit seed/key algorithm used by MSD80/81 security access.
pub fn calc_key_msd80(seed: u16) -> u16 {
    (seed ^ 0x5A3C).wrapping_add(0x7F1B)
}

/// ISO 14230 negative response code description.
pub fn describe_nrc(code: u8) -> &'static str {
    match code {
        0x10 => "General reject",
        0x11 => "Service not supported",
        0x12 => "Sub-function not supported",
        0x13 => "Message length incorrect",
        0x21 => "Busy - repeat request",
        0x22 => "Conditions not correct",
        0x23 => "Routine not complete",
        0x24 => "Request sequence error",
        0x31 => "Request out of range",
        0x33 => "Security access denied",
        0x35 => "Invalid key",
        0x36 => "Exceed number of attempts",
        0x37 => "Required time delay not expired",
        0x40 => "Download not accepted",
        0x42 => "Can not download to specified address",
        0x43 => "Can not download number of bytes requested",
        0x71 => "Transfer suspended",
        0x72 => "Transfer aborted",
        0x74 => "Illegal address in block transfer",
        0x75 => "Illegal byte count in block transfer",
        0x78 => "Request correctly received, response pending",
        0x80 => "Service not supported in active diagnostic session",
        _ => "Unknown error",
    }
}

/// Typed KWP2000 client bound to the fixed MSD80/81 arbitration ids.
pub struct KwpClient<B> {
    transport: IsoTp<B>,
}

impl<B: FrameBus> KwpClient<B> {
    pub fn new(bus: B, timeout: Duration) -> Self {
        Self {
            transport: IsoTp::new(bus, can_ids::TESTER_TO_ECU, can_ids::ECU_TO_TESTER, timeout),
        }
    }

    /// Release the underlying bus.
    pub fn shutdown(&mut self) {
        self.transport.shutdown();
    }

    /// One request/response exchange with positive-echo validation.
    fn exchange(&mut self, service: Service, payload: &[u8]) -> Result<Vec<u8>> {
        let mut request = Vec::with_capacity(1 + payload.len());
        request.push(service.sid());
        request.extend_from_slice(payload);
        debug!("{} request ({} bytes)", service, request.len());

        let response = self.transport.request(&request, true)?.unwrap_or_default();
        match response.first() {
            Some(&sid) if sid == service.positive_sid() => Ok(response),
            Some(&services::NEGATIVE_RESPONSE) => {
                let code = response.get(2).copied().unwrap_or(0);
                warn!(
                    "{} rejected: {} (NRC 0x{:02X})",
                    service,
                    describe_nrc(code),
                    code
                );
                Err(Error::Protocol { service, response })
            }
            _ => Err(Error::Protocol { service, response }),
        }
    }

    pub fn start_diagnostic_session(&mut self, session_type: u8) -> Result<()> {
        self.exchange(Service::StartDiagnosticSession, &[session_type])
            .map(drop)
    }

    pub fn ecu_reset(&mut self, reset_type: u8) -> Result<()> {
        self.exchange(Service::EcuReset, &[reset_type]).map(drop)
    }

    /// Request the 16-bit security seed.
    pub fn request_seed(&mut self) -> Result<u16> {
        let response = self.exchange(Service::SecurityAccess, &[security::REQUEST_SEED])?;
        let bytes = response.get(2..4).ok_or_else(|| Error::Protocol {
            service: Service::SecurityAccess,
            response: response.clone(),
        })?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Send the computed key.
    pub fn send_key(&mut self, key: u16) -> Result<()> {
        let [hi, lo] = key.to_be_bytes();
        self.exchange(Service::SecurityAccess, &[security::SEND_KEY, hi, lo])
            .map(drop)
    }

    pub fn tester_present(&mut self) -> Result<()> {
        self.exchange(Service::TesterPresent, &[0x00]).map(drop)
    }

    /// Read one identification record; the echoed identifier is stripped.
    pub fn read_ecu_identification(&mut self, identifier: u8) -> Result<Vec<u8>> {
        let response = self.exchange(Service::ReadEcuIdentification, &[identifier])?;
        Ok(response.get(2..).unwrap_or_default().to_vec())
    }

    /// ReadMemoryByAddress with the MSD80 addressing format
    /// (`0x24` + 4-byte address + `0x24` + 4-byte length, big-endian).
    pub fn read_memory(&mut self, address: u32, length: u16) -> Result<Vec<u8>> {
        let mut payload = [0u8; 10];
        payload[0] = 0x24;
        payload[1..5].copy_from_slice(&address.to_be_bytes());
        payload[5] = 0x24;
        payload[6..10].copy_from_slice(&u32::from(length).to_be_bytes());
        let response = self.exchange(Service::ReadMemoryByAddress, &payload)?;
        Ok(response[1..].to_vec())
    }

    /// Start a flash routine (RoutineControl / startRoutine).
    pub fn start_routine(&mut self, routine_id: u16) -> Result<()> {
        let [hi, lo] = routine_id.to_be_bytes();
        self.exchange(Service::RoutineControl, &[0x01, hi, lo])
            .map(drop)
    }

    /// Negotiate a download; returns the ECU's maximum transfer block size.
    pub fn request_download(&mut self, address: u32, length: u32) -> Result<usize> {
        let mut payload = [0u8; 10];
        payload[0] = 0x00;
        payload[1] = 0x44;
        payload[2..6].copy_from_slice(&address.to_be_bytes());
        payload[6..10].copy_from_slice(&length.to_be_bytes());
        let response = self.exchange(Service::RequestDownload, &payload)?;

        let max_len_len = usize::from(response.get(1).copied().unwrap_or(0));
        if max_len_len == 0 {
            return Ok(transfer::DEFAULT_BLOCK);
        }
        let bytes = response.get(2..2 + max_len_len).ok_or_else(|| Error::Protocol {
            service: Service::RequestDownload,
            response: response.clone(),
        })?;
        let max_chunk = bytes
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        if max_chunk == 0 {
            return Ok(transfer::DEFAULT_BLOCK);
        }
        info!("ECU reports {} byte max transfer block", max_chunk);
        Ok(max_chunk)
    }

    /// One TransferData block: sequence byte followed by the data chunk.
    pub fn transfer_data(&mut self, counter: u8, block: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(1 + block.len());
        payload.push(counter);
        payload.extend_from_slice(block);
        self.exchange(Service::TransferData, &payload).map(drop)
    }

    pub fn request_transfer_exit(&mut self) -> Result<()> {
        self.exchange(Service::RequestTransferExit, &[]).map(drop)
    }
}
