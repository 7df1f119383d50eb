//! Configuration for the manager.
//!
//! Settings come from a JSON file; a few deployment-specific values can be
//! overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lift_networking::PortPoolParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::brain::{BrainParams, ProcessClass};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// One launchable worker class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSettings {
    pub name: String,

    /// Binary to run. Defaults to `name`.
    #[serde(default)]
    pub executable: Option<String>,

    /// Arguments placed before the worker flags.
    #[serde(default)]
    pub args: Vec<String>,

    pub connection_capacity: i64,

    pub max_backfill_secs: u64,
}

/// Manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_service_version")]
    pub service_version: String,

    /// Address the HTTP API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub classes: Vec<ClassSettings>,

    /// Address passed to workers with `-a`.
    #[serde(default = "default_worker_listen_address")]
    pub worker_listen_address: String,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_port_start")]
    pub port_start: u16,

    #[serde(default = "default_port_capacity")]
    pub port_capacity: u16,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_minimum_wait_for_close_secs")]
    pub minimum_wait_for_close_secs: u64,
}

fn default_service_name() -> String {
    "lift".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9990".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

fn default_port_start() -> u16 {
    7777
}

fn default_port_capacity() -> u16 {
    100
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_minimum_wait_for_close_secs() -> u64 {
    60
}

impl Settings {
    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut settings = Self::from_json(&raw)?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply `LIFT_LISTEN_ADDR` and `LIFT_LOG_LEVEL`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LIFT_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(level) = lookup("LIFT_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.classes.is_empty() {
            return Err(invalid("at least one class is required"));
        }
        for class in &self.classes {
            if class.name.is_empty() {
                return Err(invalid("class name must not be empty"));
            }
            if class.connection_capacity <= 0 {
                return Err(invalid(format!(
                    "class {} needs a positive connection_capacity",
                    class.name
                )));
            }
        }

        if self.port_start == 0 {
            return Err(invalid("port_start must be non-zero"));
        }
        if self.port_capacity == 0 {
            return Err(invalid("port_capacity must be non-zero"));
        }
        let last = u32::from(self.port_start) + u32::from(self.port_capacity) - 1;
        if last > u32::from(u16::MAX) {
            return Err(invalid(format!(
                "port range {}..={} exceeds {}",
                self.port_start,
                last,
                u16::MAX
            )));
        }

        if self.heartbeat_timeout_secs == 0 {
            return Err(invalid("heartbeat_timeout_secs must be non-zero"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(invalid("sweep_interval_secs must be non-zero"));
        }
        if self.minimum_wait_for_close_secs == 0 {
            return Err(invalid("minimum_wait_for_close_secs must be non-zero"));
        }

        Ok(())
    }

    pub fn brain_params(&self) -> BrainParams {
        let classes = self
            .classes
            .iter()
            .enumerate()
            .map(|(index, class)| ProcessClass {
                name: class.name.clone(),
                index,
                executable: class
                    .executable
                    .clone()
                    .unwrap_or_else(|| class.name.clone()),
                args: class.args.clone(),
                capacity: class.connection_capacity,
                max_backfill_secs: class.max_backfill_secs,
            })
            .collect();

        BrainParams {
            classes,
            worker_listen_address: self.worker_listen_address.clone(),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            ports: PortPoolParams {
                start_from: self.port_start,
                capacity: self.port_capacity,
            },
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            minimum_wait_for_close: Duration::from_secs(self.minimum_wait_for_close_secs),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "classes": [
            { "name": "arena", "connection_capacity": 8, "max_backfill_secs": 300 }
        ]
    }"#;

    fn minimal() -> Settings {
        Settings::from_json(MINIMAL).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = minimal();
        assert_eq!(settings.service_name, "lift");
        assert_eq!(settings.listen_addr, "0.0.0.0:9990");
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.worker_listen_address, "0.0.0.0");
        assert_eq!(settings.port_start, 7777);
        assert_eq!(settings.port_capacity, 100);
        assert_eq!(settings.heartbeat_timeout_secs, 10);
        assert_eq!(settings.sweep_interval_secs, 10);
        assert_eq!(settings.minimum_wait_for_close_secs, 60);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_brain_params() {
        let settings = Settings::from_json(
            r#"{
                "classes": [
                    { "name": "arena", "connection_capacity": 8, "max_backfill_secs": 300 },
                    { "name": "lobby", "executable": "/opt/lobby/bin", "args": ["--quiet"],
                      "connection_capacity": 64, "max_backfill_secs": 0 }
                ],
                "port_start": 9000,
                "port_capacity": 16,
                "heartbeat_timeout_secs": 3,
                "sweep_interval_secs": 5,
                "minimum_wait_for_close_secs": 30
            }"#,
        )
        .unwrap();

        let params = settings.brain_params();
        assert_eq!(params.classes.len(), 2);
        assert_eq!(params.classes[0].executable, "arena");
        assert_eq!(params.classes[1].index, 1);
        assert_eq!(params.classes[1].executable, "/opt/lobby/bin");
        assert_eq!(params.classes[1].args, vec!["--quiet".to_string()]);
        assert_eq!(params.classes[1].capacity, 64);
        assert_eq!(
            params.ports,
            PortPoolParams {
                start_from: 9000,
                capacity: 16
            }
        );
        assert_eq!(params.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(params.sweep_interval, Duration::from_secs(5));
        assert_eq!(params.minimum_wait_for_close, Duration::from_secs(30));
    }

    #[rstest]
    #[case::no_classes(|s: &mut Settings| s.classes.clear())]
    #[case::zero_capacity(|s: &mut Settings| s.classes[0].connection_capacity = 0)]
    #[case::empty_name(|s: &mut Settings| s.classes[0].name.clear())]
    #[case::zero_port(|s: &mut Settings| s.port_start = 0)]
    #[case::zero_port_capacity(|s: &mut Settings| s.port_capacity = 0)]
    #[case::port_overflow(|s: &mut Settings| { s.port_start = 65500; s.port_capacity = 100; })]
    #[case::zero_heartbeat(|s: &mut Settings| s.heartbeat_timeout_secs = 0)]
    #[case::zero_sweep(|s: &mut Settings| s.sweep_interval_secs = 0)]
    #[case::zero_min_wait(|s: &mut Settings| s.minimum_wait_for_close_secs = 0)]
    fn test_validate_rejects(#[case] mutate: fn(&mut Settings)) {
        let mut settings = minimal();
        mutate(&mut settings);
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_port_range_may_end_at_max() {
        let mut settings = minimal();
        settings.port_start = 65436;
        settings.port_capacity = 100;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("LIFT_LISTEN_ADDR", "127.0.0.1:1234"),
            ("LIFT_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut settings = minimal();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(settings.listen_addr, "127.0.0.1:1234");
        assert_eq!(settings.log_level, "debug");

        let mut untouched = minimal();
        untouched.apply_overrides(|_| None);
        assert_eq!(untouched, minimal());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.classes[0].name, "arena");
    }

    #[test]
    fn test_load_errors() {
        let missing = Settings::load("/nonexistent/lift/setting.json");
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            Settings::load(file.path()),
            Err(ConfigError::Parse(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "classes": [] }"#).unwrap();
        assert!(matches!(
            Settings::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
