//! Write a raw binary image to a target device
//!
//! A [FlashSession] walks the ROM loader through a fixed sequence of steps:
//! handshake, chip identification, flash probing, programming and finalizing.
//! Every request goes through a [Transport] with a budget suited to the step,
//! and any failure ends the session.

use std::{io::Read, str::FromStr, time::Duration};

use log::{debug, info, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

use crate::{
    command::Command,
    error::{Error, ResultExt},
    image_format::{self, FirmwareImage, ESP_MAGIC, FLASH_WRITE_SIZE},
    targets::{Chip, ChipProfile, ChipRegistry, FlashStrategy, CHIP_DETECT_MAGIC_REG_ADDR},
};

/// Flash erase granularity
pub const FLASH_SECTOR_SIZE: usize = 0x1000;

/// Number of bytes read back from the start of flash while probing
const PROBE_LEN: u32 = 16;

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 12 MHz
    #[serde(rename = "12MHz")]
    #[strum(serialize = "12MHz")]
    #[cfg_attr(feature = "cli", value(name = "12MHz"))]
    _12Mhz,
    /// 20 MHz
    #[serde(rename = "20MHz")]
    #[strum(serialize = "20MHz")]
    #[cfg_attr(feature = "cli", value(name = "20MHz"))]
    _20Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    #[strum(serialize = "26MHz")]
    #[cfg_attr(feature = "cli", value(name = "26MHz"))]
    _26Mhz,
    /// 40 MHz
    #[serde(rename = "40MHz")]
    #[strum(serialize = "40MHz")]
    #[cfg_attr(feature = "cli", value(name = "40MHz"))]
    #[default]
    _40Mhz,
    /// 48 MHz
    #[serde(rename = "48MHz")]
    #[strum(serialize = "48MHz")]
    #[cfg_attr(feature = "cli", value(name = "48MHz"))]
    _48Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    #[strum(serialize = "80MHz")]
    #[cfg_attr(feature = "cli", value(name = "80MHz"))]
    _80Mhz,
}

/// Supported flash modes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, VariantNames, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Display,
    VariantNames,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[doc(alias("esp_image_flash_size_t"))]
pub enum FlashSize {
    /// 256 KB
    #[serde(rename = "256KB")]
    #[strum(serialize = "256KB")]
    #[cfg_attr(feature = "cli", value(name = "256KB"))]
    _256Kb,
    /// 512 KB
    #[serde(rename = "512KB")]
    #[strum(serialize = "512KB")]
    #[cfg_attr(feature = "cli", value(name = "512KB"))]
    _512Kb,
    /// 1 MB
    #[serde(rename = "1MB")]
    #[strum(serialize = "1MB")]
    #[cfg_attr(feature = "cli", value(name = "1MB"))]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    #[strum(serialize = "2MB")]
    #[cfg_attr(feature = "cli", value(name = "2MB"))]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    #[strum(serialize = "4MB")]
    #[cfg_attr(feature = "cli", value(name = "4MB"))]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    #[strum(serialize = "8MB")]
    #[cfg_attr(feature = "cli", value(name = "8MB"))]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    #[strum(serialize = "16MB")]
    #[cfg_attr(feature = "cli", value(name = "16MB"))]
    _16Mb,
    /// 32 MB
    #[serde(rename = "32MB")]
    #[strum(serialize = "32MB")]
    #[cfg_attr(feature = "cli", value(name = "32MB"))]
    _32Mb,
    /// 64 MB
    #[serde(rename = "64MB")]
    #[strum(serialize = "64MB")]
    #[cfg_attr(feature = "cli", value(name = "64MB"))]
    _64Mb,
    /// 128 MB
    #[serde(rename = "128MB")]
    #[strum(serialize = "128MB")]
    #[cfg_attr(feature = "cli", value(name = "128MB"))]
    _128Mb,
    /// 256 MB
    #[serde(rename = "256MB")]
    #[strum(serialize = "256MB")]
    #[cfg_attr(feature = "cli", value(name = "256MB"))]
    _256Mb,
}

impl FlashSize {
    /// Encodes flash size into the format used by the bootloader.
    ///
    /// ## Values:
    ///
    /// * <https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/firmware-image-format.html#file-header>
    pub const fn encode_flash_size(self: FlashSize) -> Result<u8, Error> {
        use FlashSize::*;

        let encoded = match self {
            _1Mb => 0,
            _2Mb => 1,
            _4Mb => 2,
            _8Mb => 3,
            _16Mb => 4,
            _32Mb => 5,
            _64Mb => 6,
            _128Mb => 7,
            _256Mb => 8,
            _ => return Err(Error::UnsupportedFlash(self as u8)),
        };

        Ok(encoded)
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0040000,
            FlashSize::_512Kb => 0x0080000,
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
            FlashSize::_32Mb => 0x2000000,
            FlashSize::_64Mb => 0x4000000,
            FlashSize::_128Mb => 0x8000000,
            FlashSize::_256Mb => 0x10000000,
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashSize::VARIANTS
            .iter()
            .copied()
            .zip(FlashSize::iter())
            .find(|(name, _)| *name == s.to_uppercase())
            .map(|(_, variant)| variant)
            .ok_or_else(|| Error::InvalidFlashSize(s.to_string()))
    }
}

/// Flash settings overriding the values found on the device
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct FlashSettings {
    pub mode: Option<FlashMode>,
    pub size: Option<FlashSize>,
    #[serde(rename = "frequency")]
    pub freq: Option<FlashFrequency>,
}

impl FlashSettings {
    pub const fn default() -> Self {
        FlashSettings {
            mode: None,
            size: None,
            freq: None,
        }
    }

    pub fn new(
        mode: Option<FlashMode>,
        size: Option<FlashSize>,
        freq: Option<FlashFrequency>,
    ) -> Self {
        FlashSettings { mode, size, freq }
    }

    /// Fill every unset field from `other`
    pub fn or(self, other: FlashSettings) -> Self {
        FlashSettings {
            mode: self.mode.or(other.mode),
            size: self.size.or(other.size),
            freq: self.freq.or(other.freq),
        }
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
///
/// See: <https://github.com/espressif/esptool/blob/da31d9d/esptool.py#L655>
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded: Vec<u8> = Vec::new();
        encoded.extend_from_slice(&self.fl_id.to_le_bytes());
        encoded.extend_from_slice(&self.total_size.to_le_bytes());
        encoded.extend_from_slice(&self.block_size.to_le_bytes());
        encoded.extend_from_slice(&self.sector_size.to_le_bytes());
        encoded.extend_from_slice(&self.page_size.to_le_bytes());
        encoded.extend_from_slice(&self.status_mask.to_le_bytes());
        encoded
    }
}

/// Parameters for attaching to a target devices SPI flash
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// Use the pins configured in eFuse
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    /// Encode the parameters into the ROM loader's 8 byte form
    pub fn encode(self) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();
        encoded.extend_from_slice(&[0u8; 4]);
        encoded
    }
}

/// Flash access parameters as stored in an image header
///
/// All three values are raw header codes: `spi_mode` is header byte 2,
/// `flash_size` and `spi_speed` are the high and low nibble of byte 3.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    pub spi_mode: u8,
    pub spi_speed: u8,
    pub flash_size: u8,
}

impl FlashGeometry {
    /// Read the geometry from the first bytes of an application image
    pub fn from_header(header: &[u8]) -> Result<Self, Error> {
        match header {
            [ESP_MAGIC, _, mode, config, ..] => Ok(FlashGeometry {
                spi_mode: *mode,
                spi_speed: config & 0x0F,
                flash_size: config >> 4,
            }),
            [magic, ..] => Err(Error::InvalidFlashHeader(*magic)),
            [] => Err(Error::InvalidResponse {
                expected: 4,
                got: 0,
            }),
        }
    }

    /// Header byte 3: size code in the high nibble, speed code in the low one
    pub fn flash_config(&self) -> u8 {
        (self.flash_size << 4) | (self.spi_speed & 0x0F)
    }
}

/// Header codes requested by the caller, already encoded for the chip
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct GeometryOverrides {
    spi_mode: Option<u8>,
    spi_speed: Option<u8>,
    flash_size: Option<u8>,
}

impl GeometryOverrides {
    fn encode(settings: &FlashSettings, strategy: &FlashStrategy) -> Result<Self, Error> {
        Ok(GeometryOverrides {
            spi_mode: settings.mode.map(|mode| mode as u8),
            spi_speed: settings
                .freq
                .map(|freq| strategy.encode_flash_frequency(freq))
                .transpose()?,
            flash_size: settings.size.map(FlashSize::encode_flash_size).transpose()?,
        })
    }

    fn apply(&self, probed: FlashGeometry) -> FlashGeometry {
        FlashGeometry {
            spi_mode: self.spi_mode.unwrap_or(probed.spi_mode),
            spi_speed: self.spi_speed.unwrap_or(probed.spi_speed),
            flash_size: self.flash_size.unwrap_or(probed.flash_size),
        }
    }

    fn complete(&self) -> Option<FlashGeometry> {
        Some(FlashGeometry {
            spi_mode: self.spi_mode?,
            spi_speed: self.spi_speed?,
            flash_size: self.flash_size?,
        })
    }
}

/// Reply of the ROM loader to a single request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandResponse {
    /// The 32-bit value field of the response header
    pub value: u32,
    /// Payload, without the trailing status bytes
    pub data: Vec<u8>,
}

/// A request/response channel to a ROM loader
pub trait Transport {
    /// Send one request and wait up to `timeout` for its response
    ///
    /// Retrying the handshake and discarding stale replies is up to the
    /// implementation; every other failure is returned as is.
    fn exchange(&mut self, command: Command<'_>, timeout: Duration)
        -> Result<CommandResponse, Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn exchange(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        (**self).exchange(command, timeout)
    }
}

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Outcome of a completed session
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct FlashSummary {
    pub chip: Chip,
    pub chip_name: &'static str,
    pub offset: u32,
    pub size: u32,
    pub blocks: u32,
    pub geometry: FlashGeometry,
    pub verified: bool,
}

/// One flashing run against one device
pub struct FlashSession<'a, T> {
    transport: T,
    registry: &'a ChipRegistry,
    strategy: &'a FlashStrategy,
    offset: u32,
    overrides: GeometryOverrides,
    verify: bool,
}

impl<'a, T: Transport> FlashSession<'a, T> {
    /// Prepare a session; the chip tag and offset are checked before any I/O
    pub fn new(
        transport: T,
        registry: &'a ChipRegistry,
        tag: &str,
        offset: u32,
    ) -> Result<Self, Error> {
        let strategy = registry.strategy(tag)?;

        if offset as usize % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::UnalignedOffset(offset));
        }

        Ok(FlashSession {
            transport,
            registry,
            strategy,
            offset,
            overrides: GeometryOverrides::default(),
            verify: false,
        })
    }

    /// Replace probed flash parameters with the ones set in `settings`
    pub fn with_settings(mut self, settings: FlashSettings) -> Result<Self, Error> {
        self.overrides = GeometryOverrides::encode(&settings, self.strategy)?;
        Ok(self)
    }

    /// Compare the flash contents with the image after programming
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Run the whole session, consuming it and closing the transport
    pub fn flash<R: Read>(
        mut self,
        image: FirmwareImage<R>,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<FlashSummary, Error> {
        self.handshake()?;
        let profile = self.identify()?;
        let geometry = self.probe()?;
        let programmed = self.program(image, &geometry, &mut progress)?;
        self.finalize()?;

        let summary = FlashSummary {
            chip: profile.chip,
            chip_name: profile.name,
            offset: self.offset,
            size: programmed.size,
            blocks: programmed.blocks,
            geometry,
            verified: programmed.verified,
        };
        info!("Flashing has completed!");

        Ok(summary)
    }

    fn exchange(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let command_type = command.command_type();
        let timeout = command.timeout();
        self.transport
            .exchange(command, timeout)
            .for_command(command_type)
    }

    fn handshake(&mut self) -> Result<(), Error> {
        debug!("Handshake");
        self.exchange(Command::Sync)?;
        Ok(())
    }

    fn identify(&mut self) -> Result<&'a ChipProfile, Error> {
        debug!("Identify");
        let response = self.exchange(Command::ReadReg {
            address: CHIP_DETECT_MAGIC_REG_ADDR,
        })?;
        let profile = self.registry.identify(response.value)?;
        info!("Chip type: {}", profile.name);

        if profile.chip != self.strategy.chip {
            return Err(Error::ChipMismatch(
                self.strategy.chip.to_string(),
                profile.chip.to_string(),
            ));
        }

        Ok(profile)
    }

    fn probe(&mut self) -> Result<FlashGeometry, Error> {
        debug!("Probe");
        self.exchange(Command::SpiAttach {
            spi_params: self.strategy.spi_params,
        })?;
        self.exchange(Command::SpiSetParams {
            spi_params: SpiSetParams::default(FlashSize::_4Mb.size()),
        })?;

        let response = self.exchange(Command::ReadFlashSlow {
            offset: 0,
            size: PROBE_LEN,
        })?;

        // the ROM always answers with a 64 byte buffer
        if response.data.len() < PROBE_LEN as usize {
            return Err(Error::InvalidResponse {
                expected: PROBE_LEN as usize,
                got: response.data.len(),
            });
        }

        let geometry = match FlashGeometry::from_header(&response.data[..PROBE_LEN as usize]) {
            Ok(probed) => {
                debug!("Probed flash geometry: {:?}", probed);
                self.overrides.apply(probed)
            }
            Err(Error::InvalidFlashHeader(magic)) => match self.overrides.complete() {
                Some(geometry) => {
                    warn!("No image header found in flash, using the provided flash parameters");
                    geometry
                }
                None => return Err(Error::InvalidFlashHeader(magic)),
            },
            Err(err) => return Err(err),
        };

        debug!("Using flash geometry: {:?}", geometry);

        Ok(geometry)
    }

    fn program<R: Read>(
        &mut self,
        image: FirmwareImage<R>,
        geometry: &FlashGeometry,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Programmed, Error> {
        let size = image.size();
        let blocks = image.block_count();
        let block_size = FLASH_WRITE_SIZE as u32;
        debug!("Program: {size} bytes in {blocks} blocks at {:#x}", self.offset);

        self.exchange(Command::FlashBegin {
            size,
            blocks,
            block_size,
            offset: self.offset,
            supports_encryption: self.strategy.supports_encryption,
        })
        .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.init(self.offset, blocks as usize)
        }

        let mut hasher = Md5::new();
        let mut expected = 0u32;

        for block in image.blocks() {
            let mut block = block?;

            if block.sequence() != expected {
                return Err(Error::SequenceViolation {
                    expected,
                    found: block.sequence(),
                });
            }

            if block.is_first() {
                image_format::patch(&mut block, geometry, self.strategy.header);
            }
            hasher.update(block.data());

            debug!(
                "Writing block {}/{} ({} bytes)",
                block.sequence() + 1,
                blocks,
                block.len()
            );
            self.exchange(Command::FlashData {
                data: block.data(),
                sequence: block.sequence(),
                block_size,
            })
            .flashing()?;

            expected += 1;
            if let Some(cb) = progress.as_mut() {
                cb.update(expected as usize)
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        if expected != blocks {
            return Err(Error::SequenceViolation {
                expected: blocks,
                found: expected,
            });
        }

        let verified = if self.verify {
            self.verify_digest(size, hasher.finalize().as_slice())?;
            true
        } else {
            false
        };

        Ok(Programmed {
            size,
            blocks,
            verified,
        })
    }

    fn verify_digest(&mut self, size: u32, expected: &[u8]) -> Result<(), Error> {
        debug!("Verify");
        let response = self
            .exchange(Command::FlashMd5 {
                offset: self.offset,
                size,
            })
            .flashing()?;
        let digest = parse_md5(&response.data)?;

        if digest != expected {
            return Err(Error::DigestMismatch(expected.to_vec(), digest));
        }
        info!("Flash contents verified");

        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Error> {
        debug!("Finalize");
        self.exchange(Command::FlashEnd { reboot: true }).flashing()?;
        Ok(())
    }
}

struct Programmed {
    size: u32,
    blocks: u32,
    verified: bool,
}

/// The ROM answers FLASH_MD5 with 32 hex digits, a stub with 16 raw bytes
fn parse_md5(data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() >= 32 {
        data[..32]
            .chunks(2)
            .map(|pair| match pair {
                [hi, lo] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                    Some((hex_value(*hi) << 4) | hex_value(*lo))
                }
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or(Error::InvalidResponse {
                expected: 32,
                got: data.len(),
            })
    } else if data.len() >= 16 {
        Ok(data[..16].to_vec())
    } else {
        Err(Error::InvalidResponse {
            expected: 16,
            got: data.len(),
        })
    }
}

/// Value of an ASCII hex digit already checked with `is_ascii_hexdigit`
fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        _ => (digit | 0x20) - b'a' + 10,
    }
}
