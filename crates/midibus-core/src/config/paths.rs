//! Path utilities for the bridge configuration file

use std::path::PathBuf;

/// Config file name inside the application config directory
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Get the default config file path
///
/// Returns: `~/.config/midibus/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("midibus")
        .join(CONFIG_FILENAME)
}
