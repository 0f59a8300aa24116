use std::collections::HashMap;

use super::{Chip, FlashStrategy};
use crate::{
    flasher::{FlashFrequency, SpiAttachParams},
    image_format::HeaderVariant,
};

pub(crate) const CHIP_ID: u16 = 5;

pub(crate) const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x6921_506f, // ECO1 + ECO2
    0x1b31_506f, // ECO3
    0x4881_606F, // ECO6
    0x4361_606f, // ECO7
];

/// Flashing strategy for the ESP32-C3 ROM loader
pub(crate) fn strategy() -> FlashStrategy {
    use FlashFrequency::*;

    FlashStrategy {
        chip: Chip::Esp32c3,
        header: HeaderVariant::new(CHIP_ID),
        spi_params: SpiAttachParams::default(),
        supports_encryption: true,
        frequency_encodings: HashMap::from([
            (_20Mhz, 0x2),
            (_26Mhz, 0x1),
            (_40Mhz, 0x0),
            (_80Mhz, 0xf),
        ]),
    }
}
