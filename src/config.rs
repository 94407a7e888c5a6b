use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{slog_debug, Error, Result};

pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_TIMEWAIT_SECS: u64 = 120;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const DEFAULT_MAX_PARALLEL_MEMBERS: usize = 8;

/// Engine-wide defaults, read from `~/.stacksched/stacksched.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-attempt timeout given to jobs that do not set one.
    pub default_timeout_secs: u64,
    /// Wait between attempts for jobs that do not set one.
    pub default_timewait_secs: u64,
    /// Upper bound on top-level jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Upper bound on concurrently running members of one parallel group.
    pub max_parallel_members: usize,
    /// Default for `keep_resources_on_failure` on new schedule definitions.
    pub keep_resources_on_failure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_timewait_secs: DEFAULT_TIMEWAIT_SECS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            max_parallel_members: DEFAULT_MAX_PARALLEL_MEMBERS,
            keep_resources_on_failure: false,
        }
    }
}

impl Config {
    pub fn state_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".stacksched"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::state_dir()?.join("stacksched.toml"))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn default_timewait(&self) -> Duration {
        Duration::from_secs(self.default_timewait_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        slog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            slog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        slog_debug!(
            "Config loaded: timeout={}s timewait={}s max_jobs={} max_members={}",
            config.default_timeout_secs,
            config.default_timewait_secs,
            config.max_concurrent_jobs,
            config.max_parallel_members
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        slog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(Error::config("default_timeout_secs must be positive"));
        }
        if self.max_concurrent_jobs == 0 || self.max_parallel_members == 0 {
            return Err(Error::config(
                "max_concurrent_jobs and max_parallel_members must be at least 1",
            ));
        }
        Ok(())
    }
}
