// src/settings.rs
//
// Bridge settings, loaded from a TOML file.
//
// Example:
//   serial_port = "/dev/ttyUSB0"
//   ws_host = "localhost"
//   ws_port = 8767
//
//   [influxdb]
//   url = "http://localhost:8086"
//   org = "my-org"
//   bucket = "sensors"
//   measurement = "ta612c_lab1"

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "ta612c-bridge";
const SETTINGS_FILE: &str = "bridge.toml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InfluxSettings {
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub measurement: String,
    /// Prefer the keyring or TA612C_INFLUX_TOKEN over storing the token here
    #[serde(default)]
    pub token: Option<String>,
}

impl InfluxSettings {
    /// Names of required fields that are still empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.org.trim().is_empty() {
            missing.push("org");
        }
        if self.bucket.trim().is_empty() {
            missing.push("bucket");
        }
        if self.measurement.trim().is_empty() {
            missing.push("measurement");
        }
        missing
    }

    /// Keyring profile identifying this org/bucket pair.
    pub fn credential_profile(&self) -> String {
        format!("influxdb/{}/{}", self.org, self.bucket)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BridgeSettings {
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "default_ws_host")]
    pub ws_host: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub influxdb: Option<InfluxSettings>,
}

fn default_ws_host() -> String {
    "localhost".to_string()
}
fn default_ws_port() -> u16 {
    8767
}
fn default_influx_url() -> String {
    "http://localhost:8086".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        BridgeSettings {
            serial_port: None,
            ws_host: default_ws_host(),
            ws_port: default_ws_port(),
            log_dir: None,
            influxdb: None,
        }
    }
}

/// Default settings location: `<config dir>/ta612c-bridge/bridge.toml`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
}

/// Parse settings from TOML text.
pub fn parse_settings(content: &str) -> Result<BridgeSettings, String> {
    toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
}

/// Load settings.
///
/// An explicitly given path must exist. The default location is optional and
/// falls back to built-in defaults when absent.
pub fn load_settings(explicit: Option<&Path>) -> Result<BridgeSettings, String> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_settings_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(BridgeSettings::default()),
        },
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read settings file {}: {}", path.display(), e))?;
    parse_settings(&content)
}
