//! Configuration handling for the pb node.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! `PB_*` environment variables. Command line flags are applied last by
//! `main`.

use anyhow::{Context, Result};
use pb_session::ManagerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Options handed to whichever manager the node runs
    pub manager: ManagerConfig,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Messages gathered while loading, logged by `main` once the
    /// subscriber is installed
    pub notes: Vec<ConfigNote>,
}

/// A loading message held back until logging is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNote {
    Info(String),
    Warn(String),
}

impl ConfigNote {
    pub fn log(&self) {
        match self {
            ConfigNote::Info(message) => info!("{}", message),
            ConfigNote::Warn(message) => warn!("{}", message),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            log_level: "info".to_string(),
            notes: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootConfig {
    node: Option<FileNodeConfig>,
    logging: Option<FileLoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileNodeConfig {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    retry_bound: Option<u32>,
    retry_delay: Option<String>,
    keepalive_interval: Option<String>,
    stop_timeout: Option<String>,
    max_frame_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLoggingConfig {
    level: Option<String>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid duration for {}: {:?}", key, value))
}

impl NodeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to defaults; a file that exists but does
    /// not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                config.apply_root_config(root)?;
                config.notes.push(ConfigNote::Info(format!("Loaded configuration from {:?}", path)));
            }
            Err(e) => {
                config.notes.push(ConfigNote::Warn(format!(
                    "Config file {:?} not readable ({}), using defaults",
                    path, e
                )));
            }
        }

        config.apply_environment_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment variables, for runs without a config file
    pub fn from_environment() -> Result<Self> {
        let mut config = Self::default();
        config.apply_environment_overrides()?;
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        if let Some(node) = root.node {
            let manager = &mut self.manager;
            if let Some(host) = node.host {
                manager.host = host;
            }
            if let Some(port) = node.port {
                manager.port = port;
            }
            if node.password.is_some() {
                manager.password = node.password;
            }
            if let Some(bound) = node.retry_bound {
                manager.retry_bound = bound;
            }
            if let Some(delay) = node.retry_delay {
                manager.retry_delay = parse_duration("node.retry_delay", &delay)?;
            }
            if let Some(interval) = node.keepalive_interval {
                manager.keepalive_interval = parse_duration("node.keepalive_interval", &interval)?;
            }
            if let Some(timeout) = node.stop_timeout {
                manager.stop_timeout = parse_duration("node.stop_timeout", &timeout)?;
            }
            if let Some(size) = node.max_frame_size {
                manager.max_frame_size = size;
            }
        }

        if let Some(level) = root.logging.and_then(|logging| logging.level) {
            self.log_level = level;
        }

        Ok(())
    }

    /// Apply `PB_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let manager = &mut self.manager;
        let notes = &mut self.notes;

        if let Some(host) = lookup("PB_HOST") {
            notes.push(ConfigNote::Info(format!("Host overridden by environment: {}", host)));
            manager.host = host;
        }

        if let Some(port) = lookup("PB_PORT") {
            manager.port = port
                .parse()
                .with_context(|| format!("invalid PB_PORT: {:?}", port))?;
            notes.push(ConfigNote::Info(format!("Port overridden by environment: {}", manager.port)));
        }

        if let Some(password) = lookup("PB_PASSWORD") {
            notes.push(ConfigNote::Info("Admin password set by environment".to_string()));
            manager.password = Some(password);
        }

        if let Some(bound) = lookup("PB_RETRY_BOUND") {
            manager.retry_bound = bound
                .parse()
                .with_context(|| format!("invalid PB_RETRY_BOUND: {:?}", bound))?;
        }

        if let Some(delay) = lookup("PB_RETRY_DELAY") {
            manager.retry_delay = parse_duration("PB_RETRY_DELAY", &delay)?;
        }

        if let Some(interval) = lookup("PB_KEEPALIVE_INTERVAL") {
            manager.keepalive_interval = parse_duration("PB_KEEPALIVE_INTERVAL", &interval)?;
        }

        if let Some(timeout) = lookup("PB_STOP_TIMEOUT") {
            manager.stop_timeout = parse_duration("PB_STOP_TIMEOUT", &timeout)?;
        }

        if let Some(level) = lookup("PB_LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load(yaml: &str) -> Result<NodeConfig> {
        let mut config = NodeConfig::default();
        config.apply_root_config(serde_yaml::from_str(yaml)?)?;
        Ok(config)
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.manager.host, "localhost");
        assert_eq!(config.manager.port, 3100);
        assert_eq!(config.manager.retry_bound, 10);
        assert_eq!(config.manager.retry_delay, Duration::from_secs(5));
        assert!(config.manager.password.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node:
  host: 0.0.0.0
  port: 4100
  password: letmein
  retry_bound: 3
  retry_delay: 250ms
  keepalive_interval: 2s
logging:
  level: debug
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.manager.host, "0.0.0.0");
        assert_eq!(config.manager.port, 4100);
        assert_eq!(config.manager.password.as_deref(), Some("letmein"));
        assert_eq!(config.manager.retry_bound, 3);
        assert_eq!(config.manager.retry_delay, Duration::from_millis(250));
        assert_eq!(config.manager.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.manager.stop_timeout, ManagerConfig::default().stop_timeout);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.manager.port, NodeConfig::default().manager.port);
        assert!(matches!(
            config.notes.first(),
            Some(ConfigNote::Warn(message)) if message.contains("absent.yaml")
        ));
    }

    #[test]
    fn test_loading_messages_are_kept_for_later() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"node:\n  port: 4100\n").unwrap();

        let mut config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        assert!(matches!(
            config.notes.as_slice(),
            [ConfigNote::Info(message), ..] if message.starts_with("Loaded configuration from")
        ));

        config.notes.clear();
        config
            .apply_overrides_from(|key| (key == "PB_HOST").then(|| "10.0.0.7".to_string()))
            .unwrap();
        assert_eq!(
            config.notes,
            vec![ConfigNote::Info("Host overridden by environment: 10.0.0.7".to_string())]
        );
    }

    #[test]
    fn test_bad_values_are_errors() {
        assert!(load("node:\n  retry_delay: soon\n").is_err());
        assert!(load("node:\n  prot: 1\n").is_err());

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"node: [1, 2").unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PB_HOST", "10.0.0.7"),
            ("PB_PORT", "5000"),
            ("PB_PASSWORD", "hunter2"),
            ("PB_KEEPALIVE_INTERVAL", "1m"),
        ]
        .into_iter()
        .collect();

        let mut config = load("node:\n  port: 4100\n").unwrap();
        config
            .apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.manager.host, "10.0.0.7");
        assert_eq!(config.manager.port, 5000);
        assert_eq!(config.manager.password.as_deref(), Some("hunter2"));
        assert_eq!(config.manager.keepalive_interval, Duration::from_secs(60));
        assert_eq!(config.manager.retry_bound, 10);

        let result = config.apply_overrides_from(|key| (key == "PB_PORT").then(|| "huge".to_string()));
        assert!(result.is_err());
    }
}
