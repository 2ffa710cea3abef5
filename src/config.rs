//! Configuration management.
//!
//! Persists the options the device owner cares about across restarts: the
//! active connection mode with its transport parameters, and the three
//! preset positions. Loaded before connect; written back on request.

use crate::connection::ConnectionMode;
use crate::error::{FocusResult, FocuserError};
use crate::presets::PRESET_COUNT;
use config::Config;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub presets: PresetSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Active mode: "serial", "tcp", or "none".
    pub mode: String,
    pub serial_port: String,
    pub baud_rate: u32,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PresetSettings {
    pub preset_1: u32,
    pub preset_2: u32,
    pub preset_3: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings {
                mode: "serial".to_string(),
                serial_port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                tcp_host: "127.0.0.1".to_string(),
                tcp_port: 9999,
                handshake_timeout_ms: 2000,
            },
            presets: PresetSettings {
                preset_1: 0,
                preset_2: 0,
                preset_3: 0,
            },
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for any
    /// missing key.
    pub fn load(path: &Path) -> FocusResult<Self> {
        let defaults = Settings::default();
        let s = Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::from(path))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    /// Write settings to a TOML file.
    pub fn save(&self, path: &Path) -> FocusResult<()> {
        let text = toml::to_string_pretty(self).map_err(|e| {
            FocuserError::Validation(format!("could not serialize configuration: {}", e))
        })?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Parse the configured connection mode.
    pub fn connection_mode(&self) -> FocusResult<ConnectionMode> {
        match self.connection.mode.as_str() {
            "serial" => Ok(ConnectionMode::Serial),
            "tcp" => Ok(ConnectionMode::Tcp),
            "none" => Ok(ConnectionMode::None),
            other => Err(FocuserError::Validation(format!(
                "unknown connection mode '{}'",
                other
            ))),
        }
    }

    /// Record a connection mode for the next save.
    pub fn set_connection_mode(&mut self, mode: ConnectionMode) {
        self.connection.mode = mode.label().to_string();
    }

    /// Preset targets in slot order.
    pub fn preset_values(&self) -> [u32; PRESET_COUNT] {
        [
            self.presets.preset_1,
            self.presets.preset_2,
            self.presets.preset_3,
        ]
    }

    /// Record preset targets for the next save.
    pub fn set_preset_values(&mut self, values: [u32; PRESET_COUNT]) {
        self.presets.preset_1 = values[0];
        self.presets.preset_2 = values[1];
        self.presets.preset_3 = values[2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.connection.mode, "serial");
        assert_eq!(settings.connection.baud_rate, 9600);
        assert_eq!(settings.preset_values(), [0, 0, 0]);
        assert_eq!(
            settings.connection_mode().unwrap(),
            ConnectionMode::Serial
        );
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focuser.toml");

        let mut settings = Settings::default();
        settings.set_connection_mode(ConnectionMode::Tcp);
        settings.connection.tcp_host = "focuser.local".to_string();
        settings.set_preset_values([100, 2_000, 30_000]);
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.connection_mode().unwrap(), ConnectionMode::Tcp);
        assert_eq!(loaded.preset_values(), [100, 2_000, 30_000]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focuser.toml");
        std::fs::write(&path, "[connection]\nmode = \"tcp\"\n").unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.connection_mode().unwrap(), ConnectionMode::Tcp);
        assert_eq!(loaded.connection.baud_rate, 9600);
        assert_eq!(loaded.preset_values(), [0, 0, 0]);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut settings = Settings::default();
        settings.connection.mode = "carrier-pigeon".to_string();
        assert!(settings.connection_mode().is_err());
    }
}
