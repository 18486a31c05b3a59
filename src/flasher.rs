//! High-level flashing workflows for MSD80/81.
//!
//! The [`Flasher`] owns the KWP client behind a mutex so the background
//! tester-present heartbeat can share it during long transfers. Workflows
//! advance the session state machine and surface typed failures; nothing is
//! retried automatically, and an interrupted flash is reported, not rolled
//! back.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::FrameBus;
use crate::constants::{ident, layout, reset, routines, session, timing, transfer};
use crate::error::{Error, Result, TransportError};
use crate::heartbeat::Heartbeat;
use crate::image::FlashImage;
use crate::kwp2000::{calc_key_msd80, KwpClient, Service};

/// Lifecycle of the diagnostic link, advanced by the workflows. Ordered:
/// a state implies every state before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    SessionActive,
    Unlocked,
    Transferring,
}

/// Tunable parameters. Defaults mirror the stock tool: 1 s receive timeout,
/// 2 KiB transfer blocks, 1 KiB read strides, 2 s keep-alive cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlasherOptions {
    /// CAN receive timeout per frame.
    pub timeout: Duration,
    /// ReadMemoryByAddress stride for backup and verify (capped at 0xFFFF).
    pub read_chunk: usize,
    /// Preferred TransferData block size; the ECU's advertised maximum wins
    /// when smaller.
    pub transfer_chunk: usize,
    /// TesterPresent cadence during programming.
    pub heartbeat_interval: Duration,
}

impl Default for FlasherOptions {
    fn default() -> Self {
        Self {
            timeout: timing::DEFAULT_TIMEOUT,
            read_chunk: transfer::READ_CHUNK,
            transfer_chunk: transfer::DEFAULT_BLOCK,
            heartbeat_interval: timing::TESTER_PRESENT_INTERVAL,
        }
    }
}

/// Progress snapshot in the shape the embedding server layer broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
    pub percent: u8,
}

impl ProgressEvent {
    pub fn new(current: usize, total: usize) -> Self {
        let percent = (current * 100 / total.max(1)).min(100) as u8;
        Self {
            current,
            total,
            percent,
        }
    }
}

/// Orchestrates the info, backup, flash, and verify workflows.
pub struct Flasher<B: FrameBus + 'static> {
    client: Arc<Mutex<KwpClient<B>>>,
    options: FlasherOptions,
    state: SessionState,
}

impl<B: FrameBus + 'static> Flasher<B> {
    pub fn new(bus: B) -> Self {
        Self::with_options(bus, FlasherOptions::default())
    }

    pub fn with_options(bus: B, options: FlasherOptions) -> Self {
        Self {
            client: Arc::new(Mutex::new(KwpClient::new(bus, options.timeout))),
            options,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Release the underlying CAN bus.
    pub fn shutdown(&mut self) {
        if let Ok(mut client) = self.client.lock() {
            client.shutdown();
        }
        self.state = SessionState::Disconnected;
    }

    fn client(&self) -> Result<MutexGuard<'_, KwpClient<B>>> {
        self.client
            .lock()
            .map_err(|_| TransportError::new("KWP client lock poisoned").into())
    }

    fn require(&self, operation: &'static str, required: SessionState) -> Result<()> {
        if self.state >= required {
            Ok(())
        } else {
            Err(Error::Session {
                operation,
                state: self.state,
            })
        }
    }

    /// Drop back to `Disconnected` after a fatal protocol failure.
    fn invalidate<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = SessionState::Disconnected;
        }
        result
    }

    // ------------------------------------------------------------------
    // Session & security

    /// Enter the BMW programming session (0x10 0x85).
    pub fn enter_session(&mut self) -> Result<()> {
        let result = self.client()?.start_diagnostic_session(session::PROGRAMMING);
        self.invalidate(result)?;
        self.state = SessionState::SessionActive;
        info!("Programming session active");
        Ok(())
    }

    /// Seed/key challenge: request the seed, derive the key, send it back.
    pub fn security_unlock(&mut self) -> Result<()> {
        self.require("security_unlock", SessionState::SessionActive)?;
        let result = (|| {
            let mut client = self.client()?;
            let seed = client.request_seed()?;
            let key = calc_key_msd80(seed);
            debug!("seed 0x{:04X} -> key 0x{:04X}", seed, key);
            client.send_key(key)
        })();
        self.invalidate(result)?;
        self.state = SessionState::Unlocked;
        info!("Security access granted");
        Ok(())
    }

    /// Reboot the ECU. Typically issued after a successful flash; the link
    /// must be re-established afterwards.
    pub fn reset_ecu(&mut self) -> Result<()> {
        self.require("reset_ecu", SessionState::SessionActive)?;
        let result = self.client()?.ecu_reset(reset::HARD);
        self.state = SessionState::Disconnected;
        result
    }

    // ------------------------------------------------------------------
    // Information

    /// Read the identification records the ECU will disclose. Identifiers
    /// the ECU rejects are omitted rather than treated as fatal.
    pub fn read_ecu_id(&mut self) -> Result<BTreeMap<u8, Vec<u8>>> {
        self.require("read_ecu_id", SessionState::SessionActive)?;
        let mut records = BTreeMap::new();
        for &identifier in ident::IDENTIFIERS {
            let result = self.client()?.read_ecu_identification(identifier);
            match result {
                Ok(data) => {
                    records.insert(identifier, data);
                }
                Err(Error::Protocol { .. }) => {
                    warn!("ECU declined identification record 0x{:02X}", identifier);
                }
                Err(err) => return self.invalidate(Err(err)),
            }
        }
        Ok(records)
    }

    /// Identification records decoded for display: trailing NUL padding is
    /// stripped and non-ASCII records fall back to hex.
    pub fn read_ecu_info(&mut self) -> Result<BTreeMap<u8, String>> {
        Ok(self
            .read_ecu_id()?
            .into_iter()
            .map(|(id, raw)| (id, decode_ident(&raw)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Backup

    /// Dump the full 1 MiB flash to `output`, reporting progress per chunk.
    pub fn backup(&mut self, output: &Path, mut progress: impl FnMut(usize, usize)) -> Result<()> {
        self.require("backup", SessionState::Unlocked)?;
        info!("Backing up flash to {}", output.display());
        let result = self.backup_inner(output, &mut progress);
        self.invalidate(result)
    }

    fn backup_inner(&self, output: &Path, progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        let mut file = File::create(output)?;
        let mut read = 0usize;
        while read < layout::FLASH_SIZE {
            let block = self.read_block(read, layout::FLASH_SIZE - read)?;
            file.write_all(&block)?;
            read += block.len();
            debug!("Read 0x{:06X}/0x{:06X}", read, layout::FLASH_SIZE);
            progress(read, layout::FLASH_SIZE);
        }
        file.flush()?;
        info!("Backup complete ({} bytes)", read);
        Ok(())
    }

    /// One ReadMemoryByAddress stride; fails if the ECU returns fewer bytes
    /// than requested.
    fn read_block(&self, offset: usize, remaining: usize) -> Result<Vec<u8>> {
        let length = self
            .options
            .read_chunk
            .min(remaining)
            .min(usize::from(u16::MAX)) as u16;
        let block = self.client()?.read_memory(offset as u32, length)?;
        if block.len() != usize::from(length) {
            return Err(Error::Protocol {
                service: Service::ReadMemoryByAddress,
                response: block,
            });
        }
        Ok(block)
    }

    // ------------------------------------------------------------------
    // Flash & verify

    /// Program `image` and verify it, keeping the session alive with the
    /// tester-present heartbeat throughout the transfer.
    pub fn flash(&mut self, image: &FlashImage, mut progress: impl FnMut(usize, usize)) -> Result<()> {
        self.require("flash", SessionState::Unlocked)?;
        image.validate()?;
        let result = self.flash_inner(image.data(), &mut progress);
        self.invalidate(result)
    }

    fn flash_inner(&mut self, image: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        self.client()?.start_routine(routines::ERASE_ALL)?;
        info!("Erase routine acknowledged");

        let max_chunk = self
            .client()?
            .request_download(0, layout::FLASH_SIZE as u32)?;
        let block = self.options.transfer_chunk.min(max_chunk).max(1);
        self.state = SessionState::Transferring;
        info!("Programming with {} byte blocks", block);

        // The heartbeat must be stopped and joined on every exit path.
        let heartbeat = Heartbeat::start(Arc::clone(&self.client), self.options.heartbeat_interval);
        let transfer = self.transfer(image, block, progress);
        heartbeat.stop(timing::HEARTBEAT_JOIN_TIMEOUT);
        transfer?;

        self.state = SessionState::SessionActive;
        info!("Flash programming complete");
        self.verify_inner(image, progress)
    }

    fn transfer(&self, image: &[u8], block: usize, progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        let total = image.len();
        let mut counter: u8 = 1;
        let mut offset = 0usize;
        while offset < total {
            let chunk = &image[offset..(offset + block).min(total)];
            self.client()?.transfer_data(counter, chunk)?;
            offset += chunk.len();
            counter = counter.wrapping_add(1);
            debug!("Transferred {}/{} bytes", offset, total);
            progress(offset, total);
        }
        self.client()?.request_transfer_exit()
    }

    /// Byte-for-byte compare of the flash contents against `image`.
    pub fn verify(&mut self, image: &FlashImage, mut progress: impl FnMut(usize, usize)) -> Result<()> {
        self.require("verify", SessionState::SessionActive)?;
        let result = self.verify_inner(image.data(), &mut progress);
        self.invalidate(result)
    }

    fn verify_inner(&self, image: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
        info!("Verifying flash contents");
        let mut offset = 0usize;
        while offset < image.len() {
            let block = self.read_block(offset, image.len() - offset)?;
            let expected = &image[offset..offset + block.len()];
            if let Some(position) = block
                .iter()
                .zip(expected)
                .position(|(read, want)| read != want)
            {
                return Err(Error::VerificationMismatch {
                    address: (offset + position) as u32,
                });
            }
            offset += block.len();
            progress(offset, image.len());
        }
        info!("Verification successful");
        Ok(())
    }
}

/// Strip trailing NUL padding and decode as ASCII, falling back to hex for
/// binary records.
pub fn decode_ident(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let trimmed = &raw[..end];
    if trimmed.is_ascii() {
        String::from_utf8_lossy(trimmed).into_owned()
    } else {
        trimmed.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_states_are_ordered() {
        assert!(SessionState::Disconnected < SessionState::SessionActive);
        assert!(SessionState::SessionActive < SessionState::Unlocked);
        assert!(SessionState::Unlocked < SessionState::Transferring);
    }

    #[test]
    fn progress_event_percent() {
        assert_eq!(ProgressEvent::new(0, 0x10_0000).percent, 0);
        assert_eq!(ProgressEvent::new(0x08_0000, 0x10_0000).percent, 50);
        assert_eq!(ProgressEvent::new(0x10_0000, 0x10_0000).percent, 100);
        // Degenerate total must not divide by zero.
        assert_eq!(ProgressEvent::new(5, 0).percent, 100);
    }

    #[test]
    fn progress_event_serializes_like_the_server_payload() {
        let event = ProgressEvent::new(0x0400, 0x10_0000);
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["current"], 0x0400);
        assert_eq!(json["total"], 0x10_0000);
        assert_eq!(json["percent"], 0);
    }

    #[test]
    fn decode_ident_strips_padding() {
        assert_eq!(decode_ident(b"MSD81\x00\x00\x00"), "MSD81");
        assert_eq!(decode_ident(b""), "");
        assert_eq!(decode_ident(&[0x00, 0x00]), "");
    }

    #[test]
    fn decode_ident_falls_back_to_hex() {
        assert_eq!(decode_ident(&[0xDE, 0xAD, 0x00]), "dead");
    }
}
