//! Flashable target devices
//!
//! The [ChipRegistry] answers two questions: which flashing strategy belongs
//! to a chip tag given on the command line, and which chip is actually
//! attached, based on the value read back from its chip-detect register.

use std::collections::{BTreeMap, HashMap};

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::{
    flasher::{FlashFrequency, SpiAttachParams},
    image_format::HeaderVariant,
    Error,
};

mod esp32c3;

/// Register holding a per-chip magic value, readable through the ROM loader
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All chips the loader can be identified as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

/// Identification record of a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    pub chip: Chip,
    /// Values the chip-detect register may hold for this chip
    pub magic_values: &'static [u32],
    pub name: &'static str,
    pub header: HeaderVariant,
}

impl ChipProfile {
    const fn new(
        chip: Chip,
        magic_values: &'static [u32],
        name: &'static str,
        chip_id: u16,
    ) -> Self {
        ChipProfile {
            chip,
            magic_values,
            name,
            header: HeaderVariant::new(chip_id),
        }
    }

    /// Check if the magic value contains the specified value
    pub fn has_magic_value(&self, value: u32) -> bool {
        self.magic_values.contains(&value)
    }
}

const PROFILES: &[ChipProfile] = &[
    ChipProfile::new(Chip::Esp32, &[0x00f0_1d83], "ESP32", 0),
    ChipProfile::new(
        Chip::Esp32c2,
        &[
            0x6f51_306f, // ECO0
            0x7c41_a06f, // ECO1
        ],
        "ESP32-C2",
        12,
    ),
    ChipProfile::new(
        Chip::Esp32c3,
        esp32c3::CHIP_DETECT_MAGIC_VALUES,
        "ESP32-C3",
        esp32c3::CHIP_ID,
    ),
    ChipProfile::new(Chip::Esp32c6, &[0x2CE0_806F], "ESP32-C6", 13),
    ChipProfile::new(Chip::Esp32h2, &[0xD7B7_3E80], "ESP32-H2", 16),
    ChipProfile::new(Chip::Esp32s2, &[0x0000_07c6], "ESP32-S2", 2),
    ChipProfile::new(Chip::Esp32s3, &[0x9], "ESP32-S3", 9),
];

/// Chip specific knowledge used while flashing
///
/// The session's control flow is the same for every chip; only the values
/// held here differ.
#[derive(Debug, Clone)]
pub struct FlashStrategy {
    pub chip: Chip,
    /// Layout of the image header expected by this chip's bootloader
    pub header: HeaderVariant,
    pub spi_params: SpiAttachParams,
    /// Whether FLASH_BEGIN takes the trailing `encrypted` word
    pub supports_encryption: bool,
    frequency_encodings: HashMap<FlashFrequency, u8>,
}

impl FlashStrategy {
    /// Encodes flash frequency into the format used by the bootloader.
    pub fn encode_flash_frequency(&self, frequency: FlashFrequency) -> Result<u8, Error> {
        self.frequency_encodings
            .get(&frequency)
            .copied()
            .ok_or(Error::UnsupportedFlashFrequency {
                chip: self.chip,
                frequency,
            })
    }
}

/// Immutable lookup tables for chip tags and detected chips
#[derive(Debug, Clone)]
pub struct ChipRegistry {
    profiles: &'static [ChipProfile],
    strategies: BTreeMap<&'static str, FlashStrategy>,
}

impl Default for ChipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChipRegistry {
    /// Build the registry with every strategy this crate knows about
    pub fn new() -> Self {
        let mut strategies = BTreeMap::new();
        strategies.insert("esp32c3", esp32c3::strategy());

        ChipRegistry {
            profiles: PROFILES,
            strategies,
        }
    }

    /// Resolve a chip tag to its flashing strategy
    pub fn strategy(&self, tag: &str) -> Result<&FlashStrategy, Error> {
        self.strategies
            .get(tag.to_ascii_lowercase().as_str())
            .ok_or_else(|| Error::UnknownChipTag {
                tag: tag.to_string(),
                known: self.tags().collect::<Vec<_>>().join(", "),
            })
    }

    /// Resolve the value of the chip-detect register to a chip profile
    pub fn identify(&self, magic: u32) -> Result<&ChipProfile, Error> {
        self.profiles
            .iter()
            .find(|profile| profile.has_magic_value(magic))
            .ok_or(Error::ChipDetectError(magic))
    }

    /// Registered chip tags, in lexical order
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.strategies.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn esp32c3_is_the_default_strategy() {
        let registry = ChipRegistry::new();
        let strategy = registry.strategy("esp32c3").unwrap();

        assert_eq!(strategy.chip, Chip::Esp32c3);
        assert_eq!(strategy.header.chip_id(), 5);
        assert_eq!(registry.strategy("ESP32C3").unwrap().chip, Chip::Esp32c3);
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["esp32c3"]);
    }

    #[test]
    fn unknown_tag_is_a_configuration_error() {
        let registry = ChipRegistry::new();
        let err = registry.strategy("esp8266").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(err, Error::UnknownChipTag { ref known, .. } if known == "esp32c3"));
    }

    #[test]
    fn identify_every_revision() {
        let registry = ChipRegistry::new();

        for magic in [0x6921_506f, 0x1b31_506f, 0x4881_606f, 0x4361_606f] {
            let profile = registry.identify(magic).unwrap();
            assert_eq!(profile.chip, Chip::Esp32c3);
            assert_eq!(profile.name, "ESP32-C3");
        }
        assert_eq!(registry.identify(0x00f0_1d83).unwrap().chip, Chip::Esp32);
        assert_eq!(registry.identify(0x9).unwrap().name, "ESP32-S3");

        let err = registry.identify(0xdead_beef).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn every_chip_has_a_profile() {
        for chip in Chip::iter() {
            assert!(PROFILES.iter().any(|p| p.chip == chip), "{chip} missing");
        }
    }

    #[test]
    fn frequency_encodings() {
        let registry = ChipRegistry::new();
        let strategy = registry.strategy("esp32c3").unwrap();

        assert_eq!(
            strategy.encode_flash_frequency(FlashFrequency::_80Mhz).unwrap(),
            0xf
        );
        assert!(matches!(
            strategy.encode_flash_frequency(FlashFrequency::_48Mhz),
            Err(Error::UnsupportedFlashFrequency { .. })
        ));
    }
}
