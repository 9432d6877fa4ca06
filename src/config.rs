// ABOUTME: Configuration management for the tideway engine
// ABOUTME: Handles loading engine settings from YAML files and environment variables

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing task bodies.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,

    /// Wall-clock budget applied to a task body with no timeout of its own.
    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub default_task_timeout: Duration,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            default_task_timeout: default_task_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file path or the default locations.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let mut config: EngineConfig = serde_yaml::from_str(&contents)?;
            config.merge_env()?;
            Ok(config)
        } else {
            let mut config = EngineConfig::default();
            config.merge_env()?;
            Ok(config)
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    fn find_config_file() -> PathBuf {
        let possible_paths = vec![
            PathBuf::from("tideway.yaml"),
            PathBuf::from("tideway.yml"),
            PathBuf::from(".tideway.yaml"),
            PathBuf::from(".tideway.yml"),
        ];

        for path in possible_paths {
            if path.exists() {
                return path;
            }
        }

        PathBuf::from("tideway.yaml")
    }

    /// Merge environment variables into configuration.
    fn merge_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("TIDEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(max) = std::env::var("TIDEWAY_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = max.parse()?;
        }
        Ok(())
    }

    /// Initialize logging based on configuration.
    pub fn init_logging(&self, verbose: bool) -> Result<()> {
        let log_level = if verbose {
            "debug"
        } else {
            &self.logging.level
        };

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        match self.logging.format.as_str() {
            "compact" => {
                tracing_subscriber::fmt()
                    .compact()
                    .with_env_filter(env_filter)
                    .with_target(false)
                    .init();
            }
            _ => {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_target(false)
                    .init();
            }
        }

        debug!("Logging initialized with level: {}", log_level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.default_task_timeout, Duration::from_secs(3600));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
max_concurrent_tasks: 8
default_task_timeout: 90s
logging:
  level: debug
  format: compact
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.default_task_timeout, Duration::from_secs(90));
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let config: EngineConfig = serde_yaml::from_str("max_concurrent_tasks: 2").unwrap();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.default_task_timeout, Duration::from_secs(3600));
        assert_eq!(config.logging.level, "info");
    }

    // one test covers the whole load path so parallel tests never race on
    // the same environment variables
    #[test]
    fn test_load_reads_file_and_merges_environment() {
        let dir = tempfile::tempdir().unwrap();

        // a missing file falls back to defaults
        let config = EngineConfig::load(Some(dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.logging.level, "info");

        let path = dir.path().join("tideway.yaml");
        std::fs::write(
            &path,
            "max_concurrent_tasks: 2\nlogging:\n  level: warn\n  format: compact\n",
        )
        .unwrap();

        let config = EngineConfig::load(Some(path.clone())).unwrap();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.logging.level, "warn");

        std::env::set_var("TIDEWAY_LOG_LEVEL", "trace");
        std::env::set_var("TIDEWAY_MAX_CONCURRENT_TASKS", "8");
        let config = EngineConfig::load(Some(path)).unwrap();
        std::env::remove_var("TIDEWAY_LOG_LEVEL");
        std::env::remove_var("TIDEWAY_MAX_CONCURRENT_TASKS");

        // the environment wins over the file
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.logging.level, "trace");
        // file values without an override survive
        assert_eq!(config.logging.format, "compact");
    }
}
