use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.toml";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u32,
}

fn default_font_size() -> u32 {
    14
}

fn default_connect_timeout() -> u64 {
    40
}

fn default_keepalive() -> u32 {
    10
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            dark_mode: false,
            font_size: default_font_size(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive(),
        }
    }
}

impl AppSettings {
    pub fn load(data_dir: &Path) -> AppResult<Self> {
        let settings_path = data_dir.join(SETTINGS_FILE);
        if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(data_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, data_dir: &Path) -> AppResult<()> {
        let settings_path = data_dir.join(SETTINGS_FILE);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(settings_path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}
