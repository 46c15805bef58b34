//! Configuration loader and validator for the bulk delivery engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub dispatch: Dispatch,
    pub messaging: Messaging,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Scheduler knobs. These are the engine's operational defaults; a batch may
/// override `default_throttle_per_minute` and `default_max_retries` per
/// request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub tick_interval_ms: u64,
    pub batches_per_tick: i64,
    pub recipients_per_tick: i64,
    pub default_throttle_per_minute: i64,
    pub default_max_retries: i64,
    pub max_backoff_seconds: i64,
}

/// 1:1 message transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Messaging {
    pub base_url: String,
    pub token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.dispatch.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("dispatch.tick_interval_ms must be > 0"));
    }
    if cfg.dispatch.batches_per_tick <= 0 {
        return Err(ConfigError::Invalid("dispatch.batches_per_tick must be > 0"));
    }
    if cfg.dispatch.recipients_per_tick <= 0 {
        return Err(ConfigError::Invalid(
            "dispatch.recipients_per_tick must be > 0",
        ));
    }
    if cfg.dispatch.default_throttle_per_minute <= 0 {
        return Err(ConfigError::Invalid(
            "dispatch.default_throttle_per_minute must be > 0",
        ));
    }
    if cfg.dispatch.default_max_retries <= 0 {
        return Err(ConfigError::Invalid(
            "dispatch.default_max_retries must be > 0",
        ));
    }
    if cfg.dispatch.max_backoff_seconds <= 0 {
        return Err(ConfigError::Invalid(
            "dispatch.max_backoff_seconds must be > 0",
        ));
    }

    if cfg.messaging.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("messaging.base_url must be non-empty"));
    }
    if cfg.messaging.token.trim().is_empty() {
        return Err(ConfigError::Invalid("messaging.token must be non-empty"));
    }

    Ok(())
}

/// Example configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

dispatch:
  tick_interval_ms: 5000
  batches_per_tick: 5
  recipients_per_tick: 50
  default_throttle_per_minute: 50
  default_max_retries: 3
  max_backoff_seconds: 60

messaging:
  base_url: "http://localhost:3001/api/messaging/"
  token: "YOUR_MESSAGING_SERVICE_TOKEN"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispatch.batches_per_tick, 5);
        assert_eq!(cfg.dispatch.recipients_per_tick, 50);
    }

    #[test]
    fn invalid_tick_interval() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.tick_interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("tick_interval_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_dispatch_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.batches_per_tick = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.recipients_per_tick = -1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.default_throttle_per_minute = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.default_max_retries = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_messaging() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.messaging.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("messaging.base_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.messaging.token = "  ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.dispatch.default_max_retries, 3);
    }
}
