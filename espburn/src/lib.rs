//! A library and application for flashing raw firmware images to Espressif
//! devices through their ROM serial loader.
//!
//! ## As an application
//!
//! `espburn` can be installed using `cargo install`:
//!
//! ```bash
//! $ cargo install espburn
//! ```
//!
//! ```bash
//! $ espburn flash --port /dev/ttyUSB0 --offset 0x10000 app.bin
//! ```
//!
//! ## As a library
//!
//! `espburn` can be used as a library in other applications:
//!
//! ```toml
//! espburn = { version = "0.1", default-features = false }
//! ```
//!
//! [FlashSession] drives a single flashing run over any [Transport], which
//! makes it usable without a serial port at all. Enabling the `serialport`
//! feature adds [connection::Connection], a [Transport] backed by a real
//! device.
//!
//! [Transport]: flasher::Transport

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rust_2018_idioms)]

pub use self::{
    error::{Error, ErrorKind},
    flasher::FlashSession,
    image_format::FirmwareImage,
    targets::ChipRegistry,
};

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod command;
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub mod connection;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod targets;
