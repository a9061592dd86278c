use crate::error::{EngineError, EngineResult};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "RINGCP_CONFIG";

/// Requests issued in the startup batch: open source, statx, open destination.
pub const STARTUP_REQUESTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer_count: u16,
    pub buffer_size: u32,
    pub queue_depth: u32,
    pub sqpoll: bool,
    pub sqpoll_idle_ms: u32,
    pub truncate_destination: bool,
    pub destination_mode: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_count: 64,
            buffer_size: 32 * 1024, // 8 pages
            queue_depth: 64,
            sqpoll: false,
            sqpoll_idle_ms: 2000,
            truncate_destination: true,
            // Owner-only rwx when the destination is created.
            destination_mode: Mode::S_IRWXU.bits(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or from `$RINGCP_CONFIG` when no path is given.
    ///
    /// A missing file is not an error: defaults are used and a warning logged.
    /// A file that exists but does not parse is.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(path) => path.into(),
                None => return Ok(Self::default()),
            },
        };

        let config = match std::fs::read_to_string(&config_path) {
            Ok(content) => toml::from_str::<EngineConfig>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Configuration file not found at {}. Using default settings.",
                    config_path.display()
                );
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.buffer_count == 0 {
            return Err(invalid("buffer_count", "must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(invalid("buffer_size", "must be non-zero"));
        }
        // Completion results are 32-bit signed byte counts.
        if self.buffer_size > i32::MAX as u32 {
            return Err(invalid("buffer_size", "must not exceed i32::MAX"));
        }
        if self.queue_depth < STARTUP_REQUESTS + 1 {
            return Err(invalid(
                "queue_depth",
                "must hold the startup batch (at least 4 entries)",
            ));
        }
        if self.cq_entries() < u32::from(self.buffer_count) + STARTUP_REQUESTS {
            return Err(invalid(
                "queue_depth",
                "completion ring (2 * queue_depth) must hold every in-flight operation",
            ));
        }
        if Mode::from_bits(self.destination_mode).is_none() {
            return Err(invalid("destination_mode", "not a permission mode"));
        }
        Ok(())
    }

    /// Completion ring size requested at setup.
    pub fn cq_entries(&self) -> u32 {
        self.queue_depth.saturating_mul(2)
    }
}

fn invalid(field: &str, reason: &str) -> EngineError {
    EngineError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
