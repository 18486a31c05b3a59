//! KWP2000 flashing client for Siemens MSD80/81 engine control units.
//!
//! The MSD80/81 DME fitted to BMW N54 vehicles speaks the KWP2000 service
//! set over PT-CAN at 500 kbit/s, with ISO-TP (ISO 15765-2) segmentation
//! on arbitration ids 0x6F1 (tester) and 0x6F9 (ECU). This crate implements
//! the complete protocol stack:
//!
//! - [`bus::FrameBus`] — the capability a concrete CAN driver implements
//! - [`isotp::IsoTp`] — segmentation and reassembly over 8-byte frames
//! - [`kwp2000::KwpClient`] — typed KWP service calls with echo validation
//! - [`flasher::Flasher`] — identity read, full 1 MiB backup, flash
//!   programming with verification, and the concurrent tester-present
//!   heartbeat that keeps the session alive during long transfers
//! - [`image::FlashImage`] — image validation, VIN patching, and the
//!   additive calibration checksum
//!
//! Concrete transports (slcan serial adapters, J2534 vendor cables) and
//! user interfaces live outside this crate; they implement [`bus::FrameBus`]
//! and hand the bus to [`flasher::Flasher`].

pub mod bus;
pub mod constants;
pub mod error;
pub mod flasher;
pub mod heartbeat;
pub mod image;
mod integration_tests;
pub mod isotp;
pub mod kwp2000;

pub use bus::{Frame, FrameBus};
pub use error::{Error, Result, TransportError};
pub use flasher::{Flasher, FlasherOptions, ProgressEvent, SessionState};
pub use image::{EcuFamily, FlashImage, Sector, SECTOR_MAP};
pub use kwp2000::{calc_key_msd80, KwpClient, Service};
