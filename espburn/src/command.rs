//! Requests understood by the ROM serial loader
//!
//! Every [Command] knows its [CommandType], the time the loader may take to
//! answer it, and how to serialize itself into an unframed request packet.
//! Framing (SLIP) is left to the transport.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{SpiAttachParams, SpiSetParams};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const READ_FLASH_SLOW_TIMEOUT: Duration = Duration::from_secs(2);
const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(8);
const FLASH_BEGIN_MIN_TIMEOUT: Duration = Duration::from_secs(15);
const FLASH_DATA_MIN_TIMEOUT: Duration = Duration::from_millis(1500);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const ERASE_SECTOR_SIZE: u32 = 0x1000;

/// Value written past the end of a short final block; matches erased flash
pub const FLASH_PAD_BYTE: u8 = 0xFF;

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Types of commands that can be sent to a target device
///
/// https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#supported-by-stub-loader-and-rom-loader
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    // ROM-only, reads at most 64 bytes per request
    ReadFlashSlow = 0x0E,
    FlashMd5 = 0x13,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::ReadFlashSlow => READ_FLASH_SLOW_TIMEOUT,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT,
            CommandType::FlashBegin => FLASH_BEGIN_MIN_TIMEOUT,
            CommandType::FlashData => FLASH_DATA_MIN_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout based on the number of bytes the loader has to
    /// erase or program
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(floor: Duration, timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                floor,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }

        match self {
            CommandType::FlashBegin => {
                calc_timeout(FLASH_BEGIN_MIN_TIMEOUT, ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData => {
                calc_timeout(FLASH_DATA_MIN_TIMEOUT, ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            _ => self.timeout(),
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    /// One block of image data; `data.len()` is the number of image bytes
    /// in the block and is never larger than `block_size`
    FlashData {
        data: &'a [u8],
        sequence: u32,
        block_size: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    Sync,
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    ReadFlashSlow {
        offset: u32,
        size: u32,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ReadFlashSlow { .. } => CommandType::ReadFlashSlow,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
        }
    }

    /// Return a timeout suited to this particular request
    ///
    /// FlashBegin erases whole sectors, so its budget covers the rounded-up
    /// erase size.
    pub fn timeout(&self) -> Duration {
        match *self {
            Command::FlashBegin { size, .. } => {
                let sectors = size.div_ceil(ERASE_SECTOR_SIZE);
                let erase_size = sectors.saturating_mul(ERASE_SECTOR_SIZE);
                self.command_type().timeout_for_size(erase_size)
            }
            Command::FlashData { block_size, .. } => {
                self.command_type().timeout_for_size(block_size)
            }
            _ => self.command_type().timeout(),
        }
    }

    /// Write a command
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        // Write the Direction and Command Identifier
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )?;
            }
            Command::FlashData {
                data,
                sequence,
                block_size,
            } => {
                data_command(writer, data, block_size as usize, FLASH_PAD_BYTE, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                // 0 means reboot, 1 means stay in the loader
                write_basic(writer, &[u8::from(!reboot)], 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_FRAME, 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::SpiAttach { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::ReadFlashSlow { offset, size } => {
                // length
                writer.write_all(&(8u16.to_le_bytes()))?;
                // checksum
                writer.write_all(&(0u32.to_le_bytes()))?;
                // data
                writer.write_all(&offset.to_le_bytes())?;
                writer.write_all(&size.to_le_bytes())?;
            }
            Command::FlashMd5 { offset, size } => {
                // length
                writer.write_all(&(16u16.to_le_bytes()))?;
                // checksum
                writer.write_all(&(0u32.to_le_bytes()))?;
                // data
                writer.write_all(&offset.to_le_bytes())?;
                writer.write_all(&size.to_le_bytes())?;
                writer.write_all(&(0u32.to_le_bytes()))?;
                writer.write_all(&(0u32.to_le_bytes()))?;
            }
        };
        Ok(())
    }
}

/// Write a data array and its checksum to a writer
fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

/// Write a Begin command to a writer
fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    let data = if !supports_encryption {
        // The ESP32 does not take the `encrypted` field, so truncate the last
        // 4 bytes of the slice where it resides.
        let end = bytes.len() - 4;
        &bytes[0..end]
    } else {
        bytes
    };
    write_basic(writer, data, 0)
}

/// Write a Data command to a writer
fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);

    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

const CHECKSUM_INIT: u8 = 0xEF;

fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode(command: Command<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        command.write(&mut out).unwrap();
        out
    }

    #[test]
    fn flash_begin_layout() {
        let bytes = encode(Command::FlashBegin {
            size: 10_000,
            blocks: 3,
            block_size: 4096,
            offset: 0x1_0000,
            supports_encryption: true,
        });

        assert_eq!(&bytes[..2], &[0x00, 0x02]);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 20);
        assert_eq!(&bytes[8..12], &10_000u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &4096u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &0x1_0000u32.to_le_bytes());
        assert_eq!(bytes.len(), 8 + 20);

        let without_encryption = encode(Command::FlashBegin {
            size: 0,
            blocks: 0,
            block_size: 4096,
            offset: 0,
            supports_encryption: false,
        });
        assert_eq!(without_encryption.len(), 8 + 16);
    }

    #[test]
    fn short_flash_data_is_padded_with_erased_bytes() {
        let data = [0x12u8, 0x34, 0x56];
        let bytes = encode(Command::FlashData {
            data: &data,
            sequence: 2,
            block_size: 8,
        });

        // length covers the 16 byte block header plus the padded payload
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 16 + 8);
        // declared block size is the padded size, sequence follows
        assert_eq!(&bytes[8..12], &8u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_le_bytes());
        assert_eq!(&bytes[24..], &[0x12, 0x34, 0x56, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        let expected = [0x12u8, 0x34, 0x56, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
            .iter()
            .fold(CHECKSUM_INIT, |acc, b| acc ^ b);
        assert_eq!(&bytes[4..8], &(expected as u32).to_le_bytes());
    }

    #[test]
    fn flash_end_reboot_flag_is_inverted() {
        assert_eq!(encode(Command::FlashEnd { reboot: true })[8..], [0]);
        assert_eq!(encode(Command::FlashEnd { reboot: false })[8..], [1]);
    }

    #[test]
    fn read_flash_slow_layout() {
        let bytes = encode(Command::ReadFlashSlow {
            offset: 0,
            size: 16,
        });
        assert_eq!(bytes[1], 0x0E);
        assert_eq!(&bytes[8..], &[0, 0, 0, 0, 16, 0, 0, 0]);
    }

    #[test]
    fn erase_budget_scales_with_size() {
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(10_000),
            Duration::from_secs(15)
        );
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(4_000_000),
            Duration::from_secs(120)
        );
        assert_eq!(
            CommandType::FlashData.timeout_for_size(4096),
            Duration::from_millis(1500)
        );
        assert_eq!(CommandType::Sync.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn request_budgets() {
        let begin = |size| Command::FlashBegin {
            size,
            blocks: size.div_ceil(0x1000),
            block_size: 0x1000,
            offset: 0,
            supports_encryption: false,
        };

        // 1_000_001 bytes erase 245 sectors
        assert_eq!(
            begin(1_000_001).timeout(),
            CommandType::FlashBegin.timeout_for_size(245 * 0x1000)
        );
        assert_eq!(begin(0).timeout(), Duration::from_secs(15));
        assert_eq!(
            Command::FlashData {
                data: &[0; 16],
                sequence: 0,
                block_size: 0x1000,
            }
            .timeout(),
            Duration::from_millis(1500)
        );
        assert_eq!(Command::Sync.timeout(), Duration::from_millis(100));
        assert_eq!(
            Command::FlashMd5 { offset: 0, size: 16 }.timeout(),
            Duration::from_secs(8)
        );
    }
}
