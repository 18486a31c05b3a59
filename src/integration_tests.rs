//! Integration tests running the complete flashing workflows against a
//! scripted MSD80 mock ECU that speaks real ISO-TP and the KWP service set.

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use crate::bus::{Frame, FrameBus};
    use crate::constants::{can_ids, layout};
    use crate::error::{Error, TransportError};
    use crate::flasher::{Flasher, SessionState};
    use crate::image::{EcuFamily, FlashImage};

    // ========================================================================
    // MOCK ECU
    // ========================================================================

    const SEED: u16 = 0x1234;
    // 0x1234 ^ 0x5A3C + 0x7F1B, per the MSD80 seed/key scheme.
    const KEY: [u8; 2] = [0xC7, 0x23];

    /// ECU side of the diagnostic link: ISO-TP reassembly of tester
    /// requests, a KWP state machine over a 1 MiB flash array, and
    /// segmented responses gated on the tester's flow control.
    struct MockEcu {
        flash: Arc<Mutex<Vec<u8>>>,
        idents: BTreeMap<u8, Vec<u8>>,
        unlocked: bool,
        erased: bool,
        download_offset: Option<usize>,
        expected_counter: u8,
        /// Flash byte flipped during RequestTransferExit, to provoke a
        /// verification mismatch.
        corrupt_on_exit: Option<usize>,
        reject_erase: bool,
        out: VecDeque<Frame>,
        rx: Option<(Vec<u8>, usize)>,
        pending: VecDeque<Frame>,
    }

    impl MockEcu {
        fn new(flash: Vec<u8>) -> Self {
            assert_eq!(flash.len(), layout::FLASH_SIZE);
            Self {
                flash: Arc::new(Mutex::new(flash)),
                idents: BTreeMap::new(),
                unlocked: false,
                erased: false,
                download_offset: None,
                expected_counter: 1,
                corrupt_on_exit: None,
                reject_erase: false,
                out: VecDeque::new(),
                rx: None,
                pending: VecDeque::new(),
            }
        }

        fn flash_handle(&self) -> Arc<Mutex<Vec<u8>>> {
            Arc::clone(&self.flash)
        }

        fn handle_request(&mut self, request: Vec<u8>) {
            let response = self.dispatch(&request);
            self.respond(response);
        }

        fn dispatch(&mut self, request: &[u8]) -> Vec<u8> {
            match request {
                [0x10, session] => vec![0x50, *session],
                [0x27, 0x01] => {
                    let [hi, lo] = SEED.to_be_bytes();
                    vec![0x67, 0x01, hi, lo]
                }
                [0x27, 0x02, hi, lo] => {
                    if [*hi, *lo] == KEY {
                        self.unlocked = true;
                        vec![0x67, 0x02]
                    } else {
                        vec![0x7F, 0x27, 0x35]
                    }
                }
                [0x3E, 0x00] => vec![0x7E, 0x00],
                [0x1A, identifier] => match self.idents.get(identifier) {
                    Some(data) => {
                        let mut response = vec![0x5A, *identifier];
                        response.extend_from_slice(data);
                        response
                    }
                    None => vec![0x7F, 0x1A, 0x31],
                },
                [0x23, 0x24, a0, a1, a2, a3, 0x24, l0, l1, l2, l3] => {
                    if !self.unlocked {
                        return vec![0x7F, 0x23, 0x33];
                    }
                    let address = u32::from_be_bytes([*a0, *a1, *a2, *a3]) as usize;
                    let length = u32::from_be_bytes([*l0, *l1, *l2, *l3]) as usize;
                    let flash = self.flash.lock().unwrap();
                    match flash.get(address..address + length) {
                        Some(slice) => {
                            let mut response = vec![0x63];
                            response.extend_from_slice(slice);
                            response
                        }
                        None => vec![0x7F, 0x23, 0x31],
                    }
                }
                [0x31, 0x01, 0xFF, 0x00] => {
                    if self.reject_erase || !self.unlocked {
                        return vec![0x7F, 0x31, 0x22];
                    }
                    self.erased = true;
                    self.flash.lock().unwrap().fill(0xFF);
                    vec![0x71, 0x01, 0xFF, 0x00]
                }
                [0x34, 0x00, 0x44, ..] => {
                    if !self.erased {
                        return vec![0x7F, 0x34, 0x22];
                    }
                    self.download_offset = Some(0);
                    self.expected_counter = 1;
                    // Two-byte max length: 0x0800 byte blocks.
                    vec![0x74, 0x02, 0x08, 0x00]
                }
                [0x36, counter, data @ ..] => {
                    let Some(offset) = self.download_offset else {
                        return vec![0x7F, 0x36, 0x24];
                    };
                    if *counter != self.expected_counter {
                        return vec![0x7F, 0x36, 0x24];
                    }
                    self.expected_counter = self.expected_counter.wrapping_add(1);
                    let mut flash = self.flash.lock().unwrap();
                    flash[offset..offset + data.len()].copy_from_slice(data);
                    drop(flash);
                    self.download_offset = Some(offset + data.len());
                    vec![0x76, *counter]
                }
                [0x37] => {
                    self.download_offset = None;
                    if let Some(address) = self.corrupt_on_exit {
                        self.flash.lock().unwrap()[address] ^= 0xFF;
                    }
                    vec![0x77]
                }
                other => vec![0x7F, other.first().copied().unwrap_or(0), 0x11],
            }
        }

        /// Queue a KWP response, segmenting when it exceeds one frame.
        /// Consecutive frames are held back until the tester's flow control
        /// arrives.
        fn respond(&mut self, payload: Vec<u8>) {
            if payload.len() <= 7 {
                let mut data = [0u8; 8];
                data[0] = payload.len() as u8;
                data[1..1 + payload.len()].copy_from_slice(&payload);
                self.out.push_back(Frame::new(can_ids::ECU_TO_TESTER, &data));
                return;
            }

            let mut ff = [0u8; 8];
            ff[0] = 0x10 | ((payload.len() >> 8) as u8 & 0x0F);
            ff[1] = (payload.len() & 0xFF) as u8;
            ff[2..8].copy_from_slice(&payload[..6]);
            self.out.push_back(Frame::new(can_ids::ECU_TO_TESTER, &ff));

            let mut sequence = 1u8;
            for chunk in payload[6..].chunks(7) {
                let mut cf = [0u8; 8];
                cf[0] = 0x20 | (sequence & 0x0F);
                cf[1..1 + chunk.len()].copy_from_slice(chunk);
                self.pending.push_back(Frame::new(can_ids::ECU_TO_TESTER, &cf));
                sequence = (sequence + 1) & 0x0F;
            }
        }
    }

    impl FrameBus for MockEcu {
        fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
            assert_eq!(frame.id(), can_ids::TESTER_TO_ECU);
            let data = frame.data();
            match data[0] & 0xF0 {
                0x00 => {
                    let len = usize::from(data[0] & 0x0F);
                    self.handle_request(data[1..1 + len].to_vec());
                }
                0x10 => {
                    let total = (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
                    self.rx = Some((data[2..].to_vec(), total));
                    self.out.push_back(Frame::new(
                        can_ids::ECU_TO_TESTER,
                        &[0x30, 0x00, 0x00, 0, 0, 0, 0, 0],
                    ));
                }
                0x20 => {
                    if let Some((buf, total)) = self.rx.as_mut() {
                        buf.extend_from_slice(&data[1..]);
                        if buf.len() >= *total {
                            let (mut buf, total) = self.rx.take().unwrap();
                            buf.truncate(total);
                            self.handle_request(buf);
                        }
                    }
                }
                0x30 => {
                    self.out.append(&mut self.pending);
                }
                other => panic!("unexpected PCI from tester: 0x{:02X}", other),
            }
            Ok(())
        }

        fn recv(&mut self, _timeout: std::time::Duration) -> Result<Option<Frame>, TransportError> {
            Ok(self.out.pop_front())
        }

        fn shutdown(&mut self) {}
    }

    // ========================================================================
    // TEST DATA
    // ========================================================================

    const VIN: &str = "WBAPL33549A445566";

    /// Deterministic, non-blank 1 MiB flash with a VIN planted in CAL and
    /// an intact calibration checksum.
    fn stock_flash() -> Vec<u8> {
        let mut data: Vec<u8> = (0..layout::FLASH_SIZE).map(|i| (i % 251) as u8).collect();
        data[layout::CAL_START + 0x120..layout::CAL_START + 0x120 + VIN.len()]
            .copy_from_slice(VIN.as_bytes());
        let mut image = FlashImage::new(data, EcuFamily::Msd80);
        image.fix_cal_checksum();
        image.into_data()
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("n54-flash-{}-{}.bin", tag, std::process::id()))
    }

    // ========================================================================
    // WORKFLOW TESTS
    // ========================================================================

    #[test]
    fn enter_session_and_unlock_advances_state() {
        let mut flasher = Flasher::new(MockEcu::new(stock_flash()));
        assert_eq!(flasher.state(), SessionState::Disconnected);

        flasher.enter_session().unwrap();
        assert_eq!(flasher.state(), SessionState::SessionActive);

        // The mock only accepts the key derived from seed 0x1234, so a
        // successful unlock proves the seed/key exchange end to end.
        flasher.security_unlock().unwrap();
        assert_eq!(flasher.state(), SessionState::Unlocked);
    }

    #[test]
    fn workflows_require_the_right_state() {
        let mut flasher = Flasher::new(MockEcu::new(stock_flash()));

        let err = flasher.security_unlock().unwrap_err();
        assert!(matches!(err, Error::Session { .. }));

        let err = flasher.backup(&temp_path("unused"), |_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            Error::Session {
                operation: "backup",
                state: SessionState::Disconnected,
            }
        ));
    }

    #[test]
    fn ecu_identity_is_read_and_decoded() {
        let mut ecu = MockEcu::new(stock_flash());
        ecu.idents.insert(0x90, b"MSD81 SW 00123\x00\x00".to_vec());
        ecu.idents.insert(0x92, vec![0xDE, 0xAD, 0xBE]);
        ecu.idents.insert(0x94, b"7589642\x00".to_vec());
        // 0x97 deliberately absent: the ECU answers it negatively.

        let mut flasher = Flasher::new(ecu);
        flasher.enter_session().unwrap();
        let info = flasher.read_ecu_info().unwrap();

        assert_eq!(info.len(), 3);
        assert_eq!(info[&0x90], "MSD81 SW 00123");
        assert_eq!(info[&0x92], "deadbe");
        assert_eq!(info[&0x94], "7589642");
        assert!(!info.contains_key(&0x97));
        // A declined identifier is not fatal.
        assert_eq!(flasher.state(), SessionState::SessionActive);
    }

    #[test]
    fn backup_flash_backup_roundtrips() {
        let ecu = MockEcu::new(stock_flash());
        let flash_handle = ecu.flash_handle();
        let mut flasher = Flasher::new(ecu);

        flasher.enter_session().unwrap();
        flasher.security_unlock().unwrap();

        // First backup captures the stock content.
        let first_path = temp_path("roundtrip-a");
        flasher.backup(&first_path, |_, _| {}).unwrap();
        let first = fs::read(&first_path).unwrap();
        fs::remove_file(&first_path).unwrap();
        assert_eq!(first.len(), layout::FLASH_SIZE);
        assert_eq!(first, *flash_handle.lock().unwrap());

        // Program the backup straight back. The mock enforces the
        // TransferData counter sequence, including the 0xFF -> 0x00 wrap.
        let image = FlashImage::new(first.clone(), EcuFamily::Msd80);
        let mut events = Vec::new();
        flasher.flash(&image, |done, total| events.push((done, total))).unwrap();
        assert_eq!(flasher.state(), SessionState::SessionActive);
        assert_eq!(*flash_handle.lock().unwrap(), first);

        assert!(!events.is_empty());
        assert!(events.iter().all(|(done, total)| done <= total));
        assert_eq!(events.last(), Some(&(layout::FLASH_SIZE, layout::FLASH_SIZE)));

        // Second backup must reproduce the first byte for byte.
        flasher.security_unlock().unwrap();
        let second_path = temp_path("roundtrip-b");
        flasher.backup(&second_path, |_, _| {}).unwrap();
        let second = fs::read(&second_path).unwrap();
        fs::remove_file(&second_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupted_readback_fails_verification() {
        let mut ecu = MockEcu::new(stock_flash());
        ecu.corrupt_on_exit = Some(0x12345);
        let mut flasher = Flasher::new(ecu);

        flasher.enter_session().unwrap();
        flasher.security_unlock().unwrap();

        let image = FlashImage::new(stock_flash(), EcuFamily::Msd80);
        let err = flasher.flash(&image, |_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            Error::VerificationMismatch { address: 0x12345 }
        ));
        assert_eq!(flasher.state(), SessionState::Disconnected);
    }

    #[test]
    fn rejected_erase_fails_the_flash_immediately() {
        let mut ecu = MockEcu::new(stock_flash());
        ecu.reject_erase = true;
        let mut flasher = Flasher::new(ecu);

        flasher.enter_session().unwrap();
        flasher.security_unlock().unwrap();

        let image = FlashImage::new(stock_flash(), EcuFamily::Msd80);
        let err = flasher.flash(&image, |_, _| {}).unwrap_err();
        match err {
            Error::Protocol { service, .. } => {
                assert_eq!(format!("{service}"), "RoutineControl");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(flasher.state(), SessionState::Disconnected);
    }

    #[test]
    fn invalid_image_is_rejected_before_touching_the_ecu() {
        let mut flasher = Flasher::new(MockEcu::new(stock_flash()));
        flasher.enter_session().unwrap();
        flasher.security_unlock().unwrap();

        let short = FlashImage::new(vec![0x55; layout::FLASH_SIZE - 1], EcuFamily::Msd80);
        assert!(matches!(
            flasher.flash(&short, |_, _| {}),
            Err(Error::InvalidImage(_))
        ));
        // The session survives a local validation failure.
        assert_eq!(flasher.state(), SessionState::Unlocked);
    }

    #[test]
    fn patched_image_flashes_with_zero_cal_residue() {
        let ecu = MockEcu::new(stock_flash());
        let flash_handle = ecu.flash_handle();
        let mut flasher = Flasher::new(ecu);

        flasher.enter_session().unwrap();
        flasher.security_unlock().unwrap();

        let mut image = FlashImage::new(stock_flash(), EcuFamily::Msd80);
        image.patch_vin(VIN).unwrap();
        assert_eq!(image.cal_checksum_residue(), 0);

        flasher.flash(&image, |_, _| {}).unwrap();
        assert_eq!(*flash_handle.lock().unwrap(), image.data());
    }
}
