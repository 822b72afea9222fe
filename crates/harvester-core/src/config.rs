use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKOFF_FLOOR_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CEILING_MS: u64 = 30_000;
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 300; // full trigger reload every 5 min
pub const DEFAULT_LOG_FILTER: &str = "harvester=info";

/// Top-level config (harvester.toml + HARVESTER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub triggers: TriggersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Retry back-off bounds shared by every task.
///
/// Per-task `timeout` and `retries` are registration options, not config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backoff_floor_ms: DEFAULT_BACKOFF_FLOOR_MS,
            backoff_ceiling_ms: DEFAULT_BACKOFF_CEILING_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    /// Static trigger file (TOML with a `[[triggers]]` array). Optional.
    pub file: Option<String>,
    /// Full reload cadence. 0 disables the periodic reload.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// When > 0 the file provider polls the file's mtime at this cadence and
    /// pushes a reload as soon as it changes.
    #[serde(default)]
    pub watch_interval_secs: u64,
    /// Static triggers declared directly in this config. Kept as raw values so
    /// one malformed record is dropped on its own instead of failing the load.
    #[serde(default)]
    pub inline: Vec<serde_json::Value>,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            file: None,
            reload_interval_secs: DEFAULT_RELOAD_INTERVAL_SECS,
            watch_interval_secs: 0,
            inline: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_backoff_floor_ms() -> u64 {
    DEFAULT_BACKOFF_FLOOR_MS
}
fn default_backoff_ceiling_ms() -> u64 {
    DEFAULT_BACKOFF_CEILING_MS
}
fn default_reload_interval_secs() -> u64 {
    DEFAULT_RELOAD_INTERVAL_SECS
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.harvester/harvester.db", home)
}

impl HarvesterConfig {
    /// Load config from a TOML file with HARVESTER_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `HARVESTER_EXECUTOR__BACKOFF_FLOOR_MS=500`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::HarvesterError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HARVESTER_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.harvester/harvester.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = HarvesterConfig::load(Some("/nonexistent/harvester.toml")).unwrap();
        assert_eq!(config.executor.backoff_floor_ms, DEFAULT_BACKOFF_FLOOR_MS);
        assert_eq!(config.executor.backoff_ceiling_ms, DEFAULT_BACKOFF_CEILING_MS);
        assert_eq!(config.triggers.reload_interval_secs, DEFAULT_RELOAD_INTERVAL_SECS);
        assert!(config.triggers.file.is_none());
        assert!(config.triggers.inline.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/h.db"

[executor]
backoff_floor_ms = 250

[triggers]
file = "/etc/harvester/triggers.toml"
reload_interval_secs = 0

[[triggers.inline]]
name = "nightly"
task_name = "echo"
cron = "0 3 * * *"
"#
        )
        .unwrap();

        let config = HarvesterConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.path, "/tmp/h.db");
        assert_eq!(config.executor.backoff_floor_ms, 250);
        assert_eq!(config.executor.backoff_ceiling_ms, DEFAULT_BACKOFF_CEILING_MS);
        assert_eq!(config.triggers.reload_interval_secs, 0);
        assert_eq!(config.triggers.inline.len(), 1);
        assert_eq!(config.triggers.inline[0]["task_name"], "echo");
    }
}
