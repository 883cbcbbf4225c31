use std::sync::LazyLock;

use mux_bus::SessionConfig;
use serde::{Deserialize, Serialize};

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "LITE_RECORDER_CONFIG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Software,
    Ffmpeg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub listen: String,
    pub backend: BackendKind,
    pub session: SessionConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            backend: BackendKind::default(),
            session: SessionConfig::default(),
        }
    }
}

impl RecorderConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let json = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))?;
                Self::from_json(&json)
            }
            Err(_) => Ok(Self::default()),
        }
    }
}

pub fn config() -> &'static RecorderConfig {
    static CONFIG: LazyLock<RecorderConfig> = LazyLock::new(|| {
        RecorderConfig::load().unwrap_or_else(|e| {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
