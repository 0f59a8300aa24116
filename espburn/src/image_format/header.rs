//! In-place patching of the application image header
//!
//! The second stage bootloader configures its own flash access from the
//! first bytes of the image, so the flash mode and the size/frequency byte
//! must match the attached flash chip.
//!
//! * [Header](https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/firmware-image-format.html#file-header)
//! * [Extended header](https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/firmware-image-format.html#extended-file-header)

use std::mem::size_of;

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::{debug, warn};

use super::Block;
use crate::flasher::FlashGeometry;

/// First byte of every application image
pub const ESP_MAGIC: u8 = 0xE9;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
#[doc(alias = "esp_image_header_t")]
struct ImageHeader {
    magic: u8,
    segment_count: u8,
    /// Flash read mode (esp_image_spi_mode_t)
    flash_mode: u8,
    /// ..4 bits are flash frequency (esp_image_spi_freq_t)
    /// 4.. bits are flash chip size (esp_image_flash_size_t)
    flash_config: u8,
    entry: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct ExtendedHeader {
    wp_pin: u8,
    clk_q_drv: u8,
    d_cs_drv: u8,
    gd_wp_drv: u8,
    chip_id: u16,
    min_rev: u8,
    min_chip_rev_full: u16,
    max_chip_rev_full: u16,
    reserved: [u8; 4],
    append_digest: u8,
}

impl ImageHeader {
    /// Updates flash mode and the size/frequency bit field.
    fn write_flash_config(&mut self, geometry: &FlashGeometry) {
        self.flash_mode = geometry.spi_mode;
        self.flash_config = geometry.flash_config();
    }
}

/// Header layout expected by one chip's bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderVariant {
    chip_id: u16,
}

impl HeaderVariant {
    pub const fn new(chip_id: u16) -> Self {
        HeaderVariant { chip_id }
    }

    /// Chip id stored in the extended header of images built for this chip
    pub const fn chip_id(&self) -> u16 {
        self.chip_id
    }
}

/// Rewrite the flash parameters in the header of the first block
///
/// Every other block is left alone, as is a first block that does not start
/// with an application image header. Returns whether the block was modified.
pub fn patch(block: &mut Block, geometry: &FlashGeometry, variant: HeaderVariant) -> bool {
    if !block.is_first() {
        return false;
    }

    let data = block.data_mut();
    if data.len() < size_of::<ImageHeader>() || data[0] != ESP_MAGIC {
        warn!("Image does not start with an application header, flashing it unmodified");
        return false;
    }

    let header_len = size_of::<ImageHeader>();
    let extended_len = size_of::<ExtendedHeader>();
    if data.len() >= header_len + extended_len {
        let extended: ExtendedHeader = pod_read_unaligned(&data[header_len..][..extended_len]);
        let image_chip_id = extended.chip_id;
        if image_chip_id != variant.chip_id() {
            warn!(
                "Image was built for chip id {}, but the target expects {}",
                image_chip_id,
                variant.chip_id()
            );
        }
    }

    let mut header: ImageHeader = pod_read_unaligned(&data[..header_len]);
    header.write_flash_config(geometry);
    data[..header_len].copy_from_slice(bytes_of(&header));

    debug!(
        "Patched image header: mode {:#04x}, flash config {:#04x}",
        geometry.spi_mode,
        geometry.flash_config()
    );

    true
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const C3: HeaderVariant = HeaderVariant::new(5);

    fn image(len: usize) -> Vec<u8> {
        let mut data = vec![0xAAu8; len];
        data[..8].copy_from_slice(&[ESP_MAGIC, 3, 0x02, 0x1F, 0, 0, 0, 0x40]);
        // extended header chip id
        data[12..14].copy_from_slice(&5u16.to_le_bytes());
        data
    }

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            spi_mode: 0,
            spi_speed: 2,
            flash_size: 3,
        }
    }

    #[test]
    fn first_block_receives_geometry() {
        let mut block = Block::new(0, image(64));
        assert!(patch(&mut block, &geometry(), C3));

        let mut expected = image(64);
        expected[2] = 0x00;
        expected[3] = 0x32;
        assert_eq!(block.data(), &expected[..]);
    }

    #[test]
    fn other_blocks_are_untouched() {
        let mut block = Block::new(1, image(64));
        assert!(!patch(&mut block, &geometry(), C3));
        assert_eq!(block.data(), &image(64)[..]);
    }

    #[test]
    fn non_image_data_is_untouched() {
        let mut block = Block::new(0, vec![0x00; 32]);
        assert!(!patch(&mut block, &geometry(), C3));
        assert_eq!(block.data(), &[0x00; 32][..]);

        // shorter than a header
        let mut block = Block::new(0, vec![ESP_MAGIC, 0, 0]);
        assert!(!patch(&mut block, &geometry(), C3));
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn patching_keeps_length_for_short_images() {
        let mut block = Block::new(0, image(16));
        assert!(patch(&mut block, &geometry(), HeaderVariant::new(9)));
        assert_eq!(block.len(), 16);
        assert_eq!(&block.data()[2..4], &[0x00, 0x32]);
    }
}
