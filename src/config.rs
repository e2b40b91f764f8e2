use anyhow::Context;
use serde::Deserialize;
use std::{path::Path, path::PathBuf, time::Duration};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub version: u32,
    pub database: Database,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.to_string_lossy()))?;
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    pub in_memory: bool,
    pub path: Option<PathBuf>,
}

impl Database {
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            path: None,
        }
    }

    pub fn on_disk<P: AsRef<Path>>(p: P) -> Self {
        Self {
            in_memory: false,
            path: Some(p.as_ref().to_path_buf()),
        }
    }
}

const DEFAULT_BATCH_WINDOW_MS: u64 = 1000;

fn default_batch_window_ms() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}

/// Change broadcaster settings
#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastConfig {
    /// how long notifications coalesce before one dispatch per type fires
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
}

impl BroadcastConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
        }
    }
}
