//! Streamer configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Largest interrupt report we are willing to allocate per transfer
pub const MAX_REPORT_LENGTH: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    pub logging: LoggingSettings,
    pub device: DeviceSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

/// Which device and interface to open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Bus number (as shown by `--list-devices`)
    #[serde(default)]
    pub bus: Option<u8>,
    /// Device address on the bus
    #[serde(default)]
    pub address: Option<u8>,
    #[serde(default)]
    pub interface: u8,
    /// Detach a kernel driver holding the interface
    #[serde(default = "DeviceSettings::default_detach")]
    pub detach_kernel_driver: bool,
}

impl DeviceSettings {
    fn default_detach() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// IN endpoint number to read reports from
    #[serde(default = "StreamSettings::default_endpoint")]
    pub endpoint: u8,
    /// Bytes requested per read
    #[serde(default = "StreamSettings::default_report_length")]
    pub report_length: usize,
    /// Stop after this many reports (unset = until interrupted)
    #[serde(default)]
    pub max_reports: Option<u64>,
    /// Write sent once at startup, before streaming begins
    #[serde(default)]
    pub startup_write: Option<StartupWrite>,
}

impl StreamSettings {
    fn default_endpoint() -> u8 {
        1
    }

    fn default_report_length() -> usize {
        32
    }
}

/// One-shot OUT transfer, e.g. to switch a device into reporting mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupWrite {
    pub endpoint: u8,
    /// Hex bytes, e.g. "01 03 02" or "010302"
    pub data: String,
}

impl StartupWrite {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        parse_hex(&self.data)
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            device: DeviceSettings {
                bus: None,
                address: None,
                interface: 0,
                detach_kernel_driver: DeviceSettings::default_detach(),
            },
            stream: StreamSettings {
                endpoint: StreamSettings::default_endpoint(),
                report_length: StreamSettings::default_report_length(),
                max_reports: None,
                startup_write: None,
            },
        }
    }
}

impl StreamerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-streamer/streamer.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: StreamerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-streamer").join("streamer.toml")
        } else {
            PathBuf::from(".config/usb-streamer/streamer.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.device.bus.is_some() != self.device.address.is_some() {
            return Err(anyhow!("Device bus and address must be given together"));
        }

        Self::validate_endpoint(self.stream.endpoint)?;

        if self.stream.report_length == 0 || self.stream.report_length > MAX_REPORT_LENGTH {
            return Err(anyhow!(
                "Invalid report length {}, must be 1-{}",
                self.stream.report_length,
                MAX_REPORT_LENGTH
            ));
        }

        if let Some(write) = &self.stream.startup_write {
            Self::validate_endpoint(write.endpoint)?;
            let data = write.bytes()?;
            if data.is_empty() {
                return Err(anyhow!("Startup write has no data"));
            }
        }

        Ok(())
    }

    fn validate_endpoint(endpoint: u8) -> Result<()> {
        if endpoint > 15 {
            return Err(anyhow!("Invalid endpoint {}, must be 0-15", endpoint));
        }
        Ok(())
    }
}

/// Parse hex bytes, ignoring whitespace and an optional `0x` per byte
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .split_whitespace()
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();

    if !digits.is_ascii() {
        return Err(anyhow!("Hex data '{}' contains non-hex characters", s));
    }
    if digits.len() % 2 != 0 {
        return Err(anyhow!("Hex data '{}' has an odd number of digits", s));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| anyhow!("Invalid hex byte '{}' in '{}'", &digits[i..i + 2], s))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamerConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.stream.endpoint, 1);
        assert!(config.device.detach_kernel_driver);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("01 03 02").unwrap(), vec![0x01, 0x03, 0x02]);
        assert_eq!(parse_hex("0x01 0xff").unwrap(), vec![0x01, 0xff]);
        assert_eq!(parse_hex("abCD").unwrap(), vec![0xab, 0xcd]);
        assert!(parse_hex("").unwrap().is_empty());
        assert!(parse_hex("123").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("aé1").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = StreamerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_device_path() {
        let mut config = StreamerConfig::default();
        config.device.bus = Some(3);
        assert!(config.validate().is_err());

        config.device.address = Some(7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_stream() {
        let mut config = StreamerConfig::default();
        config.stream.endpoint = 16;
        assert!(config.validate().is_err());

        config.stream.endpoint = 2;
        config.stream.report_length = 0;
        assert!(config.validate().is_err());

        config.stream.report_length = 64;
        config.stream.startup_write = Some(StartupWrite {
            endpoint: 2,
            data: "01 03 0".to_string(),
        });
        assert!(config.validate().is_err());

        config.stream.startup_write = Some(StartupWrite {
            endpoint: 2,
            data: "01 03 00".to_string(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config_uses_defaults() {
        let config: StreamerConfig =
            toml::from_str("[logging]\nlevel = \"warn\"\n\n[device]\n\n[stream]\n").unwrap();

        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.device.bus, None);
        assert_eq!(config.device.interface, 0);
        assert!(config.device.detach_kernel_driver);
        assert_eq!(config.stream.endpoint, 1);
        assert_eq!(config.stream.report_length, 32);
        assert!(config.stream.startup_write.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[logging]
level = "debug"

[device]
bus = 3
address = 7
interface = 1
detach_kernel_driver = false

[stream]
endpoint = 2
report_length = 64
max_reports = 1000

[stream.startup_write]
endpoint = 2
data = "01 03 02"
"#;
        let config: StreamerConfig = toml::from_str(content).unwrap();

        assert_eq!(config.device.bus, Some(3));
        assert_eq!(config.device.address, Some(7));
        assert_eq!(config.device.interface, 1);
        assert!(!config.device.detach_kernel_driver);
        assert_eq!(config.stream.report_length, 64);
        assert_eq!(config.stream.max_reports, Some(1000));
        let write = config.stream.startup_write.as_ref().unwrap();
        assert_eq!(write.bytes().unwrap(), vec![0x01, 0x03, 0x02]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = StreamerConfig::default();
        config.stream.max_reports = Some(10);
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: StreamerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.logging.level, parsed.logging.level);
        assert_eq!(parsed.stream.max_reports, Some(10));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("streamer.toml");

        let mut config = StreamerConfig::default();
        config.device.bus = Some(1);
        config.device.address = Some(4);
        config.save(&path).unwrap();

        let loaded = StreamerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.bus, Some(1));
        assert_eq!(loaded.device.address, Some(4));
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamer.toml");
        fs::write(
            &path,
            "[logging]\nlevel = \"loud\"\n[device]\n[stream]\n",
        )
        .unwrap();

        assert!(StreamerConfig::load(Some(path)).is_err());
    }
}
