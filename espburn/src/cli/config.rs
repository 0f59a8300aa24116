//! Command-line interface configuration
//!
//! `espburn` reads optional defaults from an `espburn.toml` file, looked up
//! in the working directory first and then in the platform's configuration
//! directory. Values given on the command line always win.
//!
//! ```toml
//! [connection]
//! serial = "/dev/ttyUSB0"
//! baudrate = 460800
//! before = "default-reset"
//!
//! [flash]
//! chip = "esp32c3"
//! mode = "dio"
//! frequency = "40MHz"
//! size = "4MB"
//! ```

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    connection::reset::ResetBeforeOperation,
    flasher::{FlashFrequency, FlashMode, FlashSettings, FlashSize},
    Error,
};

const CONFIG_FILE_NAME: &str = "espburn.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate used for communication
    pub baudrate: Option<u32>,
    /// Reset operation performed before connecting
    pub before: Option<ResetBeforeOperation>,
}

/// Chip and flash parameters
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FlashConfig {
    pub chip: Option<String>,
    pub mode: Option<FlashMode>,
    pub frequency: Option<FlashFrequency>,
    pub size: Option<FlashSize>,
}

impl FlashConfig {
    /// Flash parameter overrides named in the file
    pub fn settings(&self) -> FlashSettings {
        FlashSettings::new(self.mode, self.size, self.frequency)
    }
}

/// Deserialized contents of the configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load the configuration file, or the defaults when there is none
    pub fn load() -> Result<Self, Error> {
        match Self::find_config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No configuration file found");
                Ok(Config::default())
            }
        }
    }

    /// Load the configuration from `path`
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let data = read_to_string(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        let config: Config = toml::from_str(&data).map_err(|e| Error::InvalidConfig {
            path: path.display().to_string(),
            reason: e.message().to_string(),
        })?;
        debug!("Config from {}: {:#?}", path.display(), &config);

        Ok(config)
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::current_dir() {
            let local_config = dir.join(CONFIG_FILE_NAME);
            if local_config.exists() {
                return Some(local_config);
            }
        }

        ProjectDirs::from("rs", "esp", "espburn")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::error::ErrorKind;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn full_file() {
        let file = write_config(
            r#"
            [connection]
            serial = "/dev/ttyUSB0"
            baudrate = 460800
            before = "no-reset"

            [flash]
            chip = "esp32c3"
            mode = "dio"
            frequency = "80MHz"
            size = "16MB"
            "#,
        );

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(
            config.connection,
            Connection {
                serial: Some("/dev/ttyUSB0".into()),
                baudrate: Some(460_800),
                before: Some(ResetBeforeOperation::NoReset),
            }
        );
        assert_eq!(
            config.flash.settings(),
            FlashSettings::new(
                Some(FlashMode::Dio),
                Some(FlashSize::_16Mb),
                Some(FlashFrequency::_80Mhz)
            )
        );
    }

    #[test]
    fn sections_are_optional() {
        let file = write_config("[flash]\nchip = \"esp32c3\"\n");
        let config = Config::load_from(file.path()).unwrap();

        assert_eq!(config.connection, Connection::default());
        assert_eq!(config.flash.chip.as_deref(), Some("esp32c3"));
        assert_eq!(config.flash.settings(), FlashSettings::default());
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        for contents in [
            "[connection\n",
            "[flash]\nspeed = \"fast\"\n",
            "[flash]\nsize = \"3MB\"\n",
        ] {
            let file = write_config(contents);
            let err = Config::load_from(file.path()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{contents}");
        }
    }
}
