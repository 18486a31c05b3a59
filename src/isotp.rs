//! ISO 15765-2 transport over a raw CAN frame bus.
//!
//! Carries KWP payloads of up to 4095 bytes across the 8-byte frame
//! substrate using the Single/First/Consecutive/FlowControl sub-protocol
//! spoken by MSD80/81. Transmitted frames are always padded to 8 bytes.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::bus::{Frame, FrameBus};
use crate::error::{Error, Result, TransportError};

/// Largest payload expressible in a First frame's 12-bit length field.
pub const MAX_PAYLOAD: usize = 0x0FFF;

// PCI frame types (high nibble of the first payload byte).
const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// ISO-TP endpoint bound to one tx/rx arbitration id pair.
pub struct IsoTp<B> {
    bus: B,
    tx_id: u16,
    rx_id: u16,
    timeout: Duration,
}

impl<B: FrameBus> IsoTp<B> {
    pub fn new(bus: B, tx_id: u16, rx_id: u16, timeout: Duration) -> Self {
        Self {
            bus,
            tx_id,
            rx_id,
            timeout,
        }
    }

    /// Send `payload`; when `expect_response`, reassemble and return the
    /// reply. Times out with a transport error if the ECU stays silent.
    pub fn request(&mut self, payload: &[u8], expect_response: bool) -> Result<Option<Vec<u8>>> {
        self.send(payload)?;
        if expect_response {
            self.receive().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Release the underlying bus.
    pub fn shutdown(&mut self) {
        self.bus.shutdown();
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TransportError::new(format!(
                "payload of {} bytes exceeds the ISO-TP limit of {} bytes",
                payload.len(),
                MAX_PAYLOAD
            ))
            .into());
        }

        if payload.len() <= 7 {
            let mut data = [0u8; 8];
            data[0] = PCI_SINGLE | payload.len() as u8;
            data[1..1 + payload.len()].copy_from_slice(payload);
            self.bus.send(&Frame::new(self.tx_id, &data))?;
            return Ok(());
        }

        let total = payload.len();
        let mut ff = [0u8; 8];
        ff[0] = PCI_FIRST | ((total >> 8) as u8 & 0x0F);
        ff[1] = (total & 0xFF) as u8;
        ff[2..8].copy_from_slice(&payload[..6]);
        self.bus.send(&Frame::new(self.tx_id, &ff))?;

        let (mut block_size, mut st_min) = self.await_flow_control()?;

        let mut offset = 6;
        let mut sequence = 1u8;
        let mut sent_in_block = 0u32;
        while offset < total {
            let chunk = &payload[offset..(offset + 7).min(total)];
            let mut cf = [0u8; 8];
            cf[0] = PCI_CONSECUTIVE | (sequence & 0x0F);
            cf[1..1 + chunk.len()].copy_from_slice(chunk);
            self.bus.send(&Frame::new(self.tx_id, &cf))?;
            offset += chunk.len();
            sequence = (sequence + 1) & 0x0F;

            sent_in_block += 1;
            if block_size != 0 && sent_in_block >= u32::from(block_size) && offset < total {
                sent_in_block = 0;
                let refreshed = self.await_flow_control()?;
                block_size = refreshed.0;
                st_min = refreshed.1;
            }

            // STmin values above 0x7F are reserved; treat them as zero.
            if st_min > 0 && st_min <= 0x7F {
                thread::sleep(Duration::from_millis(u64::from(st_min)));
            }
        }
        Ok(())
    }

    fn await_flow_control(&mut self) -> Result<(u8, u8)> {
        let frame = self.recv_frame()?.ok_or(Error::NoFlowControl)?;
        let data = frame.data();
        if data.is_empty() || data[0] & 0xF0 != PCI_FLOW_CONTROL {
            return Err(Error::NoFlowControl);
        }
        let block_size = data.get(1).copied().unwrap_or(0);
        let st_min = data.get(2).copied().unwrap_or(0);
        Ok((block_size, st_min))
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let frame = self
            .recv_frame()?
            .ok_or_else(|| TransportError::new("timed out waiting for ECU response"))?;
        let data = frame.data();
        if data.is_empty() {
            return Err(TransportError::new("empty frame from ECU").into());
        }

        match data[0] & 0xF0 {
            PCI_SINGLE => {
                let len = usize::from(data[0] & 0x0F);
                let payload = data
                    .get(1..1 + len)
                    .ok_or_else(|| TransportError::new("truncated single frame"))?;
                Ok(payload.to_vec())
            }
            PCI_FIRST => {
                if data.len() < 2 {
                    return Err(TransportError::new("truncated first frame").into());
                }
                let total = (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
                let mut buf = Vec::with_capacity(total);
                buf.extend_from_slice(&data[2..]);

                // Clear to send: no block-size limit, no separation time.
                let fc = [PCI_FLOW_CONTROL, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
                self.bus.send(&Frame::new(self.tx_id, &fc))?;

                while buf.len() < total {
                    let cf = self.recv_frame()?.ok_or(Error::ConsecutiveTimeout)?;
                    let cf_data = cf.data();
                    if cf_data.is_empty() || cf_data[0] & 0xF0 != PCI_CONSECUTIVE {
                        return Err(TransportError::new(format!(
                            "expected consecutive frame, got {:02X?}",
                            cf_data
                        ))
                        .into());
                    }
                    buf.extend_from_slice(&cf_data[1..]);
                }
                buf.truncate(total);
                Ok(buf)
            }
            other => Err(TransportError::new(format!(
                "unexpected PCI 0x{:02X} at start of response",
                other
            ))
            .into()),
        }
    }

    /// Next frame on the expected rx id, skipping foreign ids until the
    /// receive timeout elapses.
    fn recv_frame(&mut self) -> Result<Option<Frame>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match self.bus.recv(deadline - now)? {
                Some(frame) if frame.id() == self.rx_id => return Ok(Some(frame)),
                Some(frame) => {
                    debug!("Ignoring frame from unexpected id 0x{:03X}", frame.id());
                }
                None => return Ok(None),
            }
        }
    }
}
