//! Configuration for the orchestration engine.
//!
//! Configuration is resolved once at `start`: defaults, then the optional
//! `.foreman/config.toml`, then CLI overrides. The resolved value is
//! embedded in the session record and immutable for the session's lifetime.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ForemanError, Result};

/// Directory under the project root holding all orchestrator state.
pub const STATE_DIR: &str = ".foreman";

/// Config file name inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Resolved orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of concurrent worker slots.
    pub max_workers: u32,
    /// Failures before a task is escalated.
    pub max_retries: u32,
    /// Successful completions allowed per UTC day.
    pub daily_task_limit: u32,
    /// Grace period before an interrupted worker is force-killed.
    pub graceful_timeout_secs: u64,
    /// Sleep between orchestration loop ticks.
    pub poll_interval_secs: u64,
    /// Per-task deadline; a worker exceeding it is terminated and the
    /// task treated as failed.
    pub max_task_duration_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_retries: 3,
            daily_task_limit: 15,
            graceful_timeout_secs: 10,
            poll_interval_secs: 2,
            max_task_duration_secs: 1800,
        }
    }
}

/// Optional CLI overrides applied on top of file config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_workers: Option<u32>,
    pub max_retries: Option<u32>,
    pub daily_task_limit: Option<u32>,
    pub graceful_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub max_task_duration_secs: Option<u64>,
}

impl OrchestratorConfig {
    /// Load configuration for a project directory: defaults, then
    /// `.foreman/config.toml` if present, then CLI overrides. Validates
    /// the result.
    pub fn load(project_dir: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let config_path = project_dir.join(STATE_DIR).join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                ForemanError::config(CONFIG_FILE, format!("parse error: {e}"))
            })?
        } else {
            Self::default()
        };

        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = overrides.max_workers {
            self.max_workers = v;
        }
        if let Some(v) = overrides.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = overrides.daily_task_limit {
            self.daily_task_limit = v;
        }
        if let Some(v) = overrides.graceful_timeout_secs {
            self.graceful_timeout_secs = v;
        }
        if let Some(v) = overrides.poll_interval_secs {
            self.poll_interval_secs = v;
        }
        if let Some(v) = overrides.max_task_duration_secs {
            self.max_task_duration_secs = v;
        }
    }

    /// Validate field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ForemanError::config("max_workers", "must be at least 1"));
        }
        if self.max_workers > 32 {
            return Err(ForemanError::config("max_workers", "must be at most 32"));
        }
        if self.daily_task_limit == 0 {
            return Err(ForemanError::config(
                "daily_task_limit",
                "must be at least 1",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ForemanError::config(
                "poll_interval_secs",
                "must be at least 1",
            ));
        }
        if self.max_task_duration_secs == 0 {
            return Err(ForemanError::config(
                "max_task_duration_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.daily_task_limit, 15);
        assert_eq!(config.graceful_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config =
            OrchestratorConfig::load(temp.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(STATE_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "max_workers = 5\nmax_retries = 1\n").unwrap();

        let config =
            OrchestratorConfig::load(temp.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.max_retries, 1);
        // Unspecified fields keep defaults
        assert_eq!(config.daily_task_limit, 15);
    }

    #[test]
    fn test_overrides_beat_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(STATE_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "max_workers = 5\n").unwrap();

        let overrides = ConfigOverrides {
            max_workers: Some(2),
            ..Default::default()
        };
        let config = OrchestratorConfig::load(temp.path(), &overrides).unwrap();
        assert_eq!(config.max_workers, 2);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = OrchestratorConfig {
            max_workers: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(STATE_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "max_workers = {{{").unwrap();

        let err =
            OrchestratorConfig::load(temp.path(), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ForemanError::Config { .. }));
    }
}
