//! Flash image handling: sector layout, validation, VIN patching, and the
//! additive calibration checksum.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::layout;
use crate::error::{Error, Result};

/// ECU variants supported by the flashing workflows. Both share the same
/// 1 MiB flash layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcuFamily {
    Msd80,
    Msd81,
}

impl fmt::Display for EcuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcuFamily::Msd80 => write!(f, "MSD80"),
            EcuFamily::Msd81 => write!(f, "MSD81"),
        }
    }
}

/// One region of the 1 MiB flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub name: &'static str,
    pub start: usize,
    pub size: usize,
    /// Protected regions are read freely but only rewritten as part of
    /// whole-image programming.
    pub protected: bool,
}

impl Sector {
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// BOOT / CAL / CODE regions, contiguous and spanning exactly 1 MiB.
pub const SECTOR_MAP: [Sector; 3] = [
    Sector {
        name: "BOOT",
        start: 0x00_0000,
        size: 0x01_0000,
        protected: true,
    },
    Sector {
        name: "CAL",
        start: layout::CAL_START,
        size: layout::CAL_SIZE,
        protected: false,
    },
    Sector {
        name: "CODE",
        start: 0x05_0000,
        size: 0x0B_0000,
        protected: true,
    },
];

/// VINs are always 17 ASCII characters.
pub const VIN_LEN: usize = 17;

/// A full 1 MiB flash image tagged with its ECU family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    data: Vec<u8>,
    family: EcuFamily,
}

impl FlashImage {
    pub fn new(data: Vec<u8>, family: EcuFamily) -> Self {
        Self { data, family }
    }

    pub fn family(&self) -> EcuFamily {
        self.family
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Size and blank checks an image must pass before programming.
    pub fn validate(&self) -> Result<()> {
        self.check_size()?;
        if self.data[..32].iter().all(|&b| b == 0xFF) {
            return Err(Error::InvalidImage("Image appears to be blank".into()));
        }
        Ok(())
    }

    fn check_size(&self) -> Result<()> {
        if self.data.len() != layout::FLASH_SIZE {
            return Err(Error::InvalidImage(format!(
                "Image must be exactly 1 MiB for {} (got {} bytes)",
                self.family,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Replace the VIN embedded in the calibration region and restore the
    /// additive checksum. Returns the absolute offset that was patched.
    ///
    /// The calibration area is searched for the first occurrence of
    /// `new_vin` itself, so the image must already carry the target VIN
    /// somewhere in CAL (typically when re-flashing a donor image).
    pub fn patch_vin(&mut self, new_vin: &str) -> Result<usize> {
        if new_vin.len() != VIN_LEN || !new_vin.is_ascii() {
            return Err(Error::InvalidVin);
        }
        self.check_size()?;

        let vin_bytes = new_vin.as_bytes();
        let cal = &self.data[layout::CAL_START..layout::CAL_END];
        let index = find(cal, vin_bytes).ok_or(Error::VinNotFound)?;
        let absolute = layout::CAL_START + index;
        self.data[absolute..absolute + VIN_LEN].copy_from_slice(vin_bytes);
        info!("Patched VIN at 0x{:06X}", absolute);

        self.fix_cal_checksum();
        Ok(absolute)
    }

    /// Rewrite the final CAL word so the additive 16-bit big-endian sum over
    /// the whole region is zero. Must run after any CAL modification.
    pub fn fix_cal_checksum(&mut self) {
        let cal = &self.data[layout::CAL_START..layout::CAL_END];
        let sum = additive_sum(&cal[..cal.len() - 2]);
        let corrected = sum.wrapping_neg();
        self.data[layout::CAL_END - 2..layout::CAL_END].copy_from_slice(&corrected.to_be_bytes());
        info!("Updated CAL checksum to 0x{:04X}", corrected);
    }

    /// Additive 16-bit sum over the full CAL region; zero when the checksum
    /// word is intact.
    pub fn cal_checksum_residue(&self) -> u16 {
        additive_sum(&self.data[layout::CAL_START..layout::CAL_END])
    }
}

/// Sum of big-endian 16-bit words modulo 2^16.
fn additive_sum(region: &[u8]) -> u16 {
    region
        .chunks_exact(2)
        .fold(0u16, |acc, word| {
            acc.wrapping_add(u16::from_be_bytes([word[0], word[1]]))
        })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
