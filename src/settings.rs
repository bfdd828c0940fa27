use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::IoError;
use crate::modem::ModemOptions;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ModemSettings {
    /// Device path, e.g. "/dev/ttyACM0" or "COM3"
    #[serde(default)]
    pub port: Option<String>,
    /// Directory for log files; file logging is off when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub options: ModemOptions,
}

/// `<config_dir>/modemport/settings.toml`
pub fn default_settings_path() -> Result<PathBuf, IoError> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| IoError::configuration("Failed to get config dir"))?;
    Ok(config_dir.join("modemport").join("settings.toml"))
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<ModemSettings, IoError> {
    if !path.exists() {
        return Ok(ModemSettings::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| IoError::configuration(format!("Failed to read settings: {}", e)))?;

    toml::from_str(&content)
        .map_err(|e| IoError::configuration(format!("Failed to parse settings: {}", e)))
}

pub fn save_settings(path: &Path, settings: &ModemSettings) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| IoError::configuration(format!("Failed to create config dir: {}", e)))?;
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| IoError::configuration(format!("Failed to serialize settings: {}", e)))?;

    std::fs::write(path, content)
        .map_err(|e| IoError::configuration(format!("Failed to write settings: {}", e)))
}
