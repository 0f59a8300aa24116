//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the [espburn]
//! command-line application, and are likely not of much use otherwise.
//!
//! No stability guarantees apply
//!
//! [espburn]: https://crates.io/crates/espburn

use std::{num::ParseIntError, path::PathBuf};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use miette::Result;

use self::config::Config;
use crate::{
    connection::{reset::ResetBeforeOperation, Connection},
    error::Error,
    flasher::{FlashFrequency, FlashMode, FlashSession, FlashSettings, FlashSize, ProgressCallbacks},
    image_format::FirmwareImage,
    targets::ChipRegistry,
};

pub mod config;

/// Chip used when neither the command line nor the configuration names one
pub const DEFAULT_CHIP: &str = "esp32c3";
/// Baud rate used when neither the command line nor the configuration names one
pub const DEFAULT_BAUD: u32 = 115_200;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[clap(short = 'p', long, env = "ESPBURN_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with target device [default: 115200]
    #[clap(short = 'b', long, env = "ESPBURN_BAUD")]
    pub baud: Option<u32>,
    /// Reset operation to perform before connecting to the chip
    #[clap(long, value_enum)]
    pub before: Option<ResetBeforeOperation>,
    /// Target chip [default: esp32c3]
    #[clap(short = 'c', long)]
    pub chip: Option<String>,
}

/// Configure the flash parameters written into the image header
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashConfigArgs {
    /// Flash frequency
    #[clap(short = 'f', long, value_name = "FREQ", value_enum)]
    pub flash_freq: Option<FlashFrequency>,
    /// Flash mode to use
    #[clap(short = 'm', long, value_name = "MODE", value_enum)]
    pub flash_mode: Option<FlashMode>,
    /// Flash size of the target
    #[clap(short = 's', long, value_name = "SIZE", value_enum)]
    pub flash_size: Option<FlashSize>,
}

/// Flash a raw binary image to a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Raw binary image to flash
    pub image: PathBuf,
    /// Flash offset to write the image to, in hexadecimal
    #[clap(short = 'o', long, value_parser = parse_u32_hex)]
    pub offset: Option<u32>,
    /// Compare the flash contents with the image after writing it
    #[clap(long)]
    pub verify: bool,

    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    #[clap(flatten)]
    pub flash_config_args: FlashConfigArgs,
}

/// Parse a hexadecimal number, with or without a `0x` prefix
pub fn parse_u32_hex(input: &str) -> Result<u32, ParseIntError> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);

    u32::from_str_radix(digits, 16)
}

/// Flash the image named in `args`, filling gaps from `config`
pub fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let offset = args.offset.ok_or(Error::MissingOption("--offset"))?;

    // Everything that can be checked locally is checked before the port is
    // opened.
    let chip = args
        .connect_args
        .chip
        .clone()
        .or_else(|| config.flash.chip.clone())
        .unwrap_or_else(|| DEFAULT_CHIP.to_string());
    let registry = ChipRegistry::new();
    registry.strategy(&chip)?;

    let image = FirmwareImage::open(&args.image)?;

    let settings = FlashSettings::new(
        args.flash_config_args.flash_mode,
        args.flash_config_args.flash_size,
        args.flash_config_args.flash_freq,
    )
    .or(config.flash.settings());

    let port = args
        .connect_args
        .port
        .clone()
        .or_else(|| config.connection.serial.clone())
        .ok_or(Error::MissingOption("--port"))?;
    let baud = args
        .connect_args
        .baud
        .or(config.connection.baudrate)
        .unwrap_or(DEFAULT_BAUD);
    let before = args
        .connect_args
        .before
        .or(config.connection.before)
        .unwrap_or_default();

    info!("Serial port: '{}'", port);
    info!("Connecting...");
    let connection = Connection::open(&port, baud, before)?;

    let mut progress = EspburnProgress::default();
    let summary = FlashSession::new(connection, &registry, &chip, offset)?
        .with_settings(settings)?
        .with_verify(args.verify)
        .flash(image, Some(&mut progress))?;
    debug!("{:#?}", summary);

    info!(
        "Wrote {} bytes ({} blocks) at {:#x} to the {}",
        summary.size, summary.blocks, summary.offset, summary.chip_name
    );

    Ok(())
}

/// Progress callback implementations for use in `espburn`
#[derive(Debug, Default)]
pub struct EspburnProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for EspburnProgress {
    /// Initialize the progress bar
    fn init(&mut self, addr: u32, len: usize) {
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        let pb = ProgressBar::new(len as u64)
            .with_message(format!("{addr:#X}"))
            .with_style(style);

        self.pb = Some(pb);
    }

    /// Set the progress bar's position
    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    /// End the progress bar
    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish();
        }
    }
}

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    ///
    /// `RUST_LOG` takes precedence over `filter`.
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
