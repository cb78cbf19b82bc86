//! Process-level configuration for the daemon.

use std::path::PathBuf;
use std::time::Duration;

use gantry_core::defaults;

/// Settings that belong to the process rather than to a library component.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root for job records (`{data_dir}/jobs`) and scratch space (`{data_dir}/scratch`).
    pub data_dir: PathBuf,
    pub health_interval: Duration,
    pub cleanup_interval: Duration,
    pub scratch_max_age: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            health_interval: Duration::from_secs(defaults::HEALTH_INTERVAL_SECS),
            cleanup_interval: Duration::from_secs(defaults::CLEANUP_INTERVAL_SECS),
            scratch_max_age: Duration::from_secs(defaults::SCRATCH_MAX_AGE_SECS),
        }
    }
}

impl DaemonConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GANTRY_DATA_DIR` | `./data` | Job records and scratch space |
    /// | `GANTRY_HEALTH_INTERVAL_SECS` | `60` | Health-check trigger period |
    /// | `GANTRY_CLEANUP_INTERVAL_SECS` | `3600` | Scratch cleanup trigger period |
    /// | `GANTRY_SCRATCH_MAX_AGE_SECS` | `86400` | Age at which scratch files are removed |
    ///
    /// Zero intervals are raised to one second.
    pub fn from_env() -> Self {
        let base = Self::default();
        let secs = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            data_dir: std::env::var("GANTRY_DATA_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(base.data_dir),
            health_interval: secs("GANTRY_HEALTH_INTERVAL_SECS")
                .unwrap_or(base.health_interval)
                .max(Duration::from_secs(1)),
            cleanup_interval: secs("GANTRY_CLEANUP_INTERVAL_SECS")
                .unwrap_or(base.cleanup_interval)
                .max(Duration::from_secs(1)),
            scratch_max_age: secs("GANTRY_SCRATCH_MAX_AGE_SECS").unwrap_or(base.scratch_max_age),
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.health_interval, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.scratch_dir(), PathBuf::from("./data/scratch"));
    }
}
