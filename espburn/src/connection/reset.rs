//! Putting the target into its ROM loader
//!
//! USB-UART bridges on development boards wire DTR to IO0 and RTS to EN, so
//! toggling the two lines in the right order resets the chip into download
//! mode.

use std::{thread::sleep, time::Duration};

use log::debug;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};

use crate::{connection::Port, error::Error};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// Some strategy for resetting a target device
pub trait ResetStrategy {
    fn reset(&self, serial: &mut Port) -> Result<(), Error>;

    fn set_dtr(&self, serial: &mut Port, level: bool) -> Result<(), Error> {
        serial.write_data_terminal_ready(level)?;

        Ok(())
    }

    fn set_rts(&self, serial: &mut Port, level: bool) -> Result<(), Error> {
        serial.write_request_to_send(level)?;

        Ok(())
    }
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, serial: &mut Port) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        self.set_dtr(serial, false)?; // IO0 = HIGH
        self.set_rts(serial, true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr(serial, true)?; // IO0 = LOW
        self.set_rts(serial, false)?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_dtr(serial, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// What to do with the target before talking to its loader
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResetBeforeOperation {
    /// Reset into the ROM loader with the DTR/RTS lines
    #[default]
    DefaultReset,
    /// The target is already in its ROM loader
    NoReset,
}

/// Reset strategies tried, in order, while connecting
pub fn reset_sequence(before: ResetBeforeOperation) -> Vec<ClassicReset> {
    match before {
        ResetBeforeOperation::DefaultReset => {
            vec![ClassicReset::new(false), ClassicReset::new(true)]
        }
        ResetBeforeOperation::NoReset => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn before_operation_names() {
        assert_eq!(
            ResetBeforeOperation::from_str("no-reset").unwrap(),
            ResetBeforeOperation::NoReset
        );
        assert_eq!(ResetBeforeOperation::DefaultReset.to_string(), "default-reset");
    }

    #[test]
    fn default_reset_alternates_delays() {
        assert_eq!(
            reset_sequence(ResetBeforeOperation::DefaultReset),
            vec![ClassicReset::new(false), ClassicReset::new(true)]
        );
        assert!(reset_sequence(ResetBeforeOperation::NoReset).is_empty());
    }
}
