//! Driver configuration
//!
//! Loaded from `driver.toml` under the XDG config directory, with a couple of
//! environment overrides for quick experiments on a device.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of native events drained by one poll
pub const DEFAULT_MAX_EVENTS: usize = 100;

/// Default hardware cursor plane edge in pixels
pub const DEFAULT_CURSOR_SIZE: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// DRM device node used by the swap chain and cursor plane
    pub device_path: PathBuf,
    /// Cap on native events handled by one `poll_and_dispatch`
    pub max_events_per_poll: usize,
    /// Bound on waiting for a screen change notification; unbounded when unset
    pub mode_confirm_timeout_ms: Option<u64>,
    /// Bound on waiting for page flip completion; unbounded when unset
    pub flip_timeout_ms: Option<u64>,
    /// Buffers in each window's swap ring (2 or 3)
    pub ring_depth: usize,
    /// Cursor plane edge in pixels
    pub cursor_size: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/dri/card0"),
            max_events_per_poll: DEFAULT_MAX_EVENTS,
            mode_confirm_timeout_ms: None,
            flip_timeout_ms: Some(1000),
            ring_depth: 3,
            cursor_size: DEFAULT_CURSOR_SIZE,
        }
    }
}

impl DriverConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("native-window-driver").join("driver.toml"))
    }

    /// Load config from `path` (or the default location), then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let contents = std::fs::read_to_string(p)?;
                let config = Self::from_toml(&contents)?;
                info!("Loaded driver config from {:?}", p);
                config
            }
            Some(ref p) => {
                debug!("No driver config at {:?}, using defaults", p);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write the config as TOML, creating the parent directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        info!("Saved driver config to {:?}", path);
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(device) = std::env::var_os("NWD_DEVICE") {
            self.device_path = PathBuf::from(device);
        }
        if let Ok(max) = std::env::var("NWD_MAX_EVENTS") {
            match max.parse() {
                Ok(n) => self.max_events_per_poll = n,
                Err(_) => warn!("Ignoring unparsable NWD_MAX_EVENTS={:?}", max),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=3).contains(&self.ring_depth) {
            return Err(Error::Config(format!(
                "ring_depth must be 2 or 3, got {}",
                self.ring_depth
            )));
        }
        if self.max_events_per_poll == 0 {
            return Err(Error::Config("max_events_per_poll must be at least 1".into()));
        }
        if self.cursor_size == 0 {
            return Err(Error::Config("cursor_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn mode_confirm_timeout(&self) -> Option<Duration> {
        self.mode_confirm_timeout_ms.map(Duration::from_millis)
    }

    pub fn flip_timeout(&self) -> Option<Duration> {
        self.flip_timeout_ms.map(Duration::from_millis)
    }
}
