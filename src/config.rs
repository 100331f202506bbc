//! Configuration management for tilecq.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (TILECQ_RING_SIZE, etc.)
//! 2. Project-local config file (`./tilecq.toml`)
//! 3. User config file (`~/.config/tilecq/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # tilecq.toml
//!
//! # Issue ring size in bytes (power of two)
//! ring_size_bytes = 1048576
//!
//! # Launch message ring entries per worker core (power of two)
//! launch_msg_entries = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// tilecq configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Issue ring size in bytes. Must be a 64-byte multiple.
    pub ring_size_bytes: Option<u64>,

    /// Launch message ring entries per worker core. Power of two.
    pub launch_msg_entries: Option<u32>,

    /// Whether worker firmware re-arms its launch loop after DONE.
    /// When false, each core runs exactly one launch and parks.
    pub relaunch_after_done: Option<bool>,

    /// How long `finish` waits before declaring a dispatch hang, in ms.
    pub finish_timeout_ms: Option<u64>,

    /// Logical worker grid width.
    pub grid_cols: Option<u32>,

    /// Logical worker grid height.
    pub grid_rows: Option<u32>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `tilecq.toml`
    /// 3. User config `~/.config/tilecq/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    pub fn ring_size_bytes(&self) -> u64 {
        self.ring_size_bytes.unwrap_or(1 << 20)
    }

    pub fn launch_msg_entries(&self) -> u32 {
        self.launch_msg_entries.unwrap_or(4)
    }

    pub fn relaunch_after_done(&self) -> bool {
        self.relaunch_after_done.unwrap_or(true)
    }

    pub fn finish_timeout_ms(&self) -> u64 {
        self.finish_timeout_ms.unwrap_or(5000)
    }

    pub fn grid_cols(&self) -> u32 {
        self.grid_cols.unwrap_or(8)
    }

    pub fn grid_rows(&self) -> u32 {
        self.grid_rows.unwrap_or(8)
    }

    /// Load user configuration from ~/.config/tilecq/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("tilecq").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./tilecq.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("tilecq.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("tilecq.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.ring_size_bytes.is_some() {
            self.ring_size_bytes = other.ring_size_bytes;
        }
        if other.launch_msg_entries.is_some() {
            self.launch_msg_entries = other.launch_msg_entries;
        }
        if other.relaunch_after_done.is_some() {
            self.relaunch_after_done = other.relaunch_after_done;
        }
        if other.finish_timeout_ms.is_some() {
            self.finish_timeout_ms = other.finish_timeout_ms;
        }
        if other.grid_cols.is_some() {
            self.grid_cols = other.grid_cols;
        }
        if other.grid_rows.is_some() {
            self.grid_rows = other.grid_rows;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("TILECQ_RING_SIZE") {
            self.ring_size_bytes = Some(v);
        }
        if let Some(v) = env_u64("TILECQ_LAUNCH_ENTRIES") {
            self.launch_msg_entries = Some(v as u32);
        }
        if let Ok(v) = std::env::var("TILECQ_RELAUNCH") {
            self.relaunch_after_done = Some(v != "0" && v != "false");
        }
        if let Some(v) = env_u64("TILECQ_FINISH_TIMEOUT_MS") {
            self.finish_timeout_ms = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tilecq").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tilecq configuration
# Place this file at ~/.config/tilecq/config.toml or ./tilecq.toml

# Issue ring size in bytes (64-byte multiple)
# ring_size_bytes = 1048576

# Launch message ring entries per worker core (power of two)
# launch_msg_entries = 4

# Re-arm worker launch loops after DONE (set false for one-shot cores)
# relaunch_after_done = true

# Dispatch hang timeout for finish/read fences, in milliseconds
# finish_timeout_ms = 5000

# Logical worker grid
# grid_cols = 8
# grid_rows = 8
"#
        .to_string()
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring non-numeric {}={}", name, raw);
            None
        }
    }
}
