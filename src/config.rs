//! Configuration loading.
//!
//! Process-level settings come from environment variables with sensible
//! defaults; the target list and probing knobs come from a YAML file. All
//! validation happens here, at startup — the rest of the system only ever
//! sees a well-formed, immutable [`Registry`].

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::{Registry, Target};

/// Default seconds between probe cycles.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;

/// Default per-probe reply deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default snapshot cadence, in probe cycles.
pub const DEFAULT_REPORT_CYCLES: u32 = 10;

/// Configuration error types. Fatal at startup only.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Process settings loaded from environment variables.
///
/// - `PINGIT_HTTP_PORT`: metrics/health listen port (default: 7030)
/// - `PINGIT_DB_PATH`: SQLite database file (default: "pingit.db")
/// - `PINGIT_CONFIG_PATH`: targets file (default: "pingit-config.yaml")
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub db_path: String,
    pub config_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 7030,
            db_path: "pingit.db".to_string(),
            config_path: "pingit-config.yaml".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PINGIT_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }
        if let Ok(db_path) = env::var("PINGIT_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(config_path) = env::var("PINGIT_CONFIG_PATH") {
            cfg.config_path = config_path;
        }

        cfg
    }
}

/// What a probe loop does when a probe outran its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Start the next cycle immediately after the late probe completes.
    Refire,
    /// Drop missed cycles and wait for the next scheduled one.
    Skip,
}

impl Default for OverrunPolicy {
    fn default() -> Self {
        OverrunPolicy::Refire
    }
}

/// Validated application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub registry: Registry,
    /// Stats snapshot cadence, in probe cycles per target.
    pub report_cycles: u32,
    pub on_overrun: OverrunPolicy,
}

// --- YAML file shape ---

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    ping: PingSection,
    #[serde(default)]
    reporting: ReportingSection,
    #[serde(default)]
    scheduling: SchedulingSection,
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PingSection {
    /// Global seconds between probe cycles; targets may override.
    interval: u64,
}

impl Default for PingSection {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ReportingSection {
    /// Snapshot cadence in probe cycles.
    interval: u32,
}

impl Default for ReportingSection {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REPORT_CYCLES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchedulingSection {
    on_overrun: OverrunPolicy,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    name: String,
    host: String,
    /// Seconds; falls back to the global ping interval.
    interval: Option<u64>,
    /// Seconds; falls back to the default timeout.
    timeout: Option<u64>,
}

/// Load and validate the targets file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    parse(&content)
}

fn parse(content: &str) -> Result<AppConfig, ConfigError> {
    let file: FileConfig = serde_yaml::from_str(content)?;

    if file.ping.interval == 0 {
        return Err(ConfigError::Invalid("ping.interval must be positive".into()));
    }
    if file.reporting.interval == 0 {
        return Err(ConfigError::Invalid(
            "reporting.interval must be positive".into(),
        ));
    }

    let mut targets = Vec::with_capacity(file.targets.len());
    let mut seen = std::collections::HashSet::new();

    for entry in file.targets {
        if entry.name.is_empty() {
            return Err(ConfigError::Invalid("target name must not be empty".into()));
        }
        if entry.host.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "target {} has an empty host",
                entry.name
            )));
        }
        if !seen.insert(entry.name.clone()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate target name: {}",
                entry.name
            )));
        }

        let interval = entry.interval.unwrap_or(file.ping.interval);
        let timeout = entry.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if interval == 0 {
            return Err(ConfigError::Invalid(format!(
                "target {} has a zero interval",
                entry.name
            )));
        }
        if timeout == 0 {
            return Err(ConfigError::Invalid(format!(
                "target {} has a zero timeout",
                entry.name
            )));
        }

        targets.push(Target {
            name: entry.name,
            host: entry.host,
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        });
    }

    Ok(AppConfig {
        registry: Registry::new(targets),
        report_cycles: file.reporting.interval,
        on_overrun: file.scheduling.on_overrun,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 7030);
        assert_eq!(cfg.db_path, "pingit.db");
        assert_eq!(cfg.config_path, "pingit-config.yaml");
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
ping:
  interval: 30
reporting:
  interval: 5
scheduling:
  on_overrun: skip
targets:
  - name: gateway
    host: 192.168.1.1
    timeout: 2
  - name: dns
    host: 8.8.8.8
    interval: 10
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.report_cycles, 5);
        assert_eq!(cfg.on_overrun, OverrunPolicy::Skip);
        assert_eq!(cfg.registry.len(), 2);

        let gw = cfg.registry.get("gateway").unwrap();
        assert_eq!(gw.interval, Duration::from_secs(30));
        assert_eq!(gw.timeout, Duration::from_secs(2));

        let dns = cfg.registry.get("dns").unwrap();
        assert_eq!(dns.interval, Duration::from_secs(10));
        assert_eq!(dns.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn empty_sections_take_defaults() {
        let cfg = parse("targets: []").unwrap();
        assert_eq!(cfg.report_cycles, DEFAULT_REPORT_CYCLES);
        assert_eq!(cfg.on_overrun, OverrunPolicy::Refire);
        assert!(cfg.registry.is_empty());
    }

    #[test]
    fn rejects_duplicate_target_names() {
        let yaml = r#"
targets:
  - name: a
    host: 1.1.1.1
  - name: a
    host: 2.2.2.2
"#;
        assert!(matches!(parse(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_durations() {
        let yaml = r#"
targets:
  - name: a
    host: 1.1.1.1
    timeout: 0
"#;
        assert!(matches!(parse(yaml), Err(ConfigError::Invalid(_))));

        assert!(matches!(
            parse("ping:\n  interval: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
