//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
#[cfg(feature = "serialport")]
use slip_codec::SlipError;
use strum::{Display as StrumDisplay, VariantNames};
use thiserror::Error;

use crate::{
    command::CommandType,
    flasher::{FlashFrequency, FlashSize},
    targets::Chip,
};

/// All possible errors returned by espburn
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Unknown chip '{tag}'")]
    #[diagnostic(
        code(espburn::unknown_chip),
        help("Registered chips are: {known}")
    )]
    UnknownChipTag { tag: String, known: String },

    #[error("Unsupported image format: {0}")]
    #[diagnostic(
        code(espburn::unsupported_image_format),
        help("Only raw flat binary images can be flashed; convert the image to a .bin file first")
    )]
    UnsupportedImageFormat(String),

    #[error("Image of {0} bytes does not fit the 32-bit flash address space")]
    #[diagnostic(code(espburn::image_too_big))]
    ImageTooBig(u64),

    #[error("The `{0}` option is required for this command")]
    #[diagnostic(code(espburn::missing_option))]
    MissingOption(&'static str),

    #[error("Flash offset {0:#x} is not aligned to a flash sector")]
    #[diagnostic(
        code(espburn::unaligned_offset),
        help("The offset must be a multiple of 0x1000")
    )]
    UnalignedOffset(u32),

    #[error("The flash size '{0}' is invalid")]
    #[diagnostic(
        code(espburn::invalid_flash_size),
        help("The accepted values are: {:?}", FlashSize::VARIANTS)
    )]
    InvalidFlashSize(String),

    #[error("The specified flash frequency '{frequency}' is not supported by the {chip}")]
    #[diagnostic(code(espburn::unsupported_flash_frequency))]
    UnsupportedFlashFrequency {
        chip: Chip,
        frequency: FlashFrequency,
    },

    #[error("Flash size code {0:#x} can not be written to an image header")]
    #[diagnostic(code(espburn::unsupported_flash))]
    UnsupportedFlash(u8),

    #[error("Invalid configuration file {path}: {reason}")]
    #[diagnostic(code(espburn::invalid_config))]
    InvalidConfig { path: String, reason: String },

    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(espburn::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetectError(u32),

    #[error("Chip provided ({0}) with `-c/--chip` does not match the detected chip ({1})")]
    #[diagnostic(
        code(espburn::chip_mismatch),
        help("Ensure that the correct chip is selected with `-c/--chip`")
    )]
    ChipMismatch(String, String),

    #[error("No application image header found at the start of flash (read {0:#04x}, expected 0xe9)")]
    #[diagnostic(
        code(espburn::invalid_flash_header),
        help("Provide `--flash-mode`, `--flash-freq` and `--flash-size` to flash a blank device")
    )]
    InvalidFlashHeader(u8),

    #[error("Block sequence violation: expected block {expected}, got {found}")]
    #[diagnostic(code(espburn::sequence_violation))]
    SequenceViolation { expected: u32, found: u32 },

    #[error("MD5 digest mismatch: expected {0:2x?}, received: {1:2x?}")]
    #[diagnostic(
        code(espburn::verify_failed),
        help("The flash contents differ from the image; flash the image again")
    )]
    DigestMismatch(Vec<u8>, Vec<u8>),

    #[error("Invalid response length, expected >= {expected}, got {got}")]
    #[diagnostic(code(espburn::invalid_response))]
    InvalidResponse { expected: usize, got: usize },

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(espburn::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("Failed to read the image")]
    #[diagnostic(code(espburn::image_read))]
    ImageRead(#[source] io::Error),

    #[error("Image ended after {read} bytes, expected {expected}")]
    #[diagnostic(
        code(espburn::truncated_image),
        help("The file was modified while it was being flashed")
    )]
    TruncatedImage { expected: u32, read: u32 },
}

/// Coarse classification of an [Error]
#[derive(Copy, Clone, Debug, PartialEq, Eq, StrumDisplay)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid input, reported before any device I/O
    Configuration,
    /// The serial link could not be opened or failed
    Connection,
    /// The target answered with something unexpected
    Protocol,
    /// The target did not answer within the step's budget
    Timeout,
    /// The source image could not be read
    Io,
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownChipTag { .. }
            | Error::UnsupportedImageFormat(_)
            | Error::ImageTooBig(_)
            | Error::MissingOption(_)
            | Error::UnalignedOffset(_)
            | Error::InvalidFlashSize(_)
            | Error::UnsupportedFlashFrequency { .. }
            | Error::UnsupportedFlash(_)
            | Error::InvalidConfig { .. } => ErrorKind::Configuration,

            Error::ChipDetectError(_)
            | Error::ChipMismatch(..)
            | Error::InvalidFlashHeader(_)
            | Error::SequenceViolation { .. }
            | Error::DigestMismatch(..)
            | Error::InvalidResponse { .. }
            | Error::RomError(_) => ErrorKind::Protocol,

            Error::Connection(err) | Error::Flashing(err) => err.kind(),

            Error::FileOpenError(..) | Error::ImageRead(_) | Error::TruncatedImage { .. } => {
                ErrorKind::Io
            }
        }
    }

    /// Build a timeout error for `command`
    pub fn timeout(command: CommandType) -> Self {
        Error::Connection(ConnectionError::Timeout(command.into()))
    }
}

#[cfg(feature = "serialport")]
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(espburn::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(espburn::connection_failed),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(espburn::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Download mode successfully detected, but getting no sync reply")]
    #[diagnostic(
        code(espburn::no_sync_reply),
        help("The serial TX path seems to be down")
    )]
    NoSyncReply,

    #[error("Received packet to large for buffer")]
    #[diagnostic(
        code(espburn::oversized_packet),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    OverSizedPacket,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(espburn::timeout))]
    Timeout(TimedOutCommand),

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(espburn::serial_error))]
    Serial(#[source] serialport::Error),
}

impl ConnectionError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Connection,
        }
    }
}

#[cfg(feature = "serialport")]
impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

#[cfg(feature = "serialport")]
impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::FramingError,
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl TimedOutCommand {
    /// The command that timed out, when known
    pub fn command(&self) -> Option<CommandType> {
        self.command
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(espburn::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(espburn::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(espburn::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(espburn::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(espburn::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(espburn::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Bad data length")]
    #[diagnostic(code(espburn::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(espburn::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(espburn::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(espburn::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(espburn::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(espburn::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(espburn::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(espburn::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(espburn::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(espburn::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

#[cfg(feature = "serialport")]
fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Into<serialport::Error>,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}
