//! WolfLease Configuration
//!
//! This module provides configuration structures for the WolfLease
//! election daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::election::ElectionConfig;
use crate::lock::LockKey;

/// Main WolfLease configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfLeaseConfig {
    /// Election configuration
    #[serde(default)]
    pub election: ElectionSection,

    /// Lock store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Status API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// Name of the election
    #[serde(default)]
    pub name: String,

    /// Identity of this participant (derived from the host name if unset)
    #[serde(default)]
    pub id: Option<String>,

    /// Namespace the election lives in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Lease TTL in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Renew deadline in milliseconds (default: half the TTL)
    #[serde(default)]
    pub renew_deadline_ms: Option<u64>,

    /// Retry period in milliseconds (default: a quarter of the TTL)
    #[serde(default)]
    pub retry_period_ms: Option<u64>,

    /// Largest backoff after failed attempts in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Timeout for a single store call in milliseconds (default: renew deadline)
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Release the lease on shutdown
    #[serde(default = "default_true")]
    pub release_on_shutdown: bool,
}

/// Lock store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// SQLite file shared by all participants on the host
    Sqlite,
    /// Process-local store, only useful for a single process
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Lock store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Database path for the SQLite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP status server
    #[serde(default)]
    pub enabled: bool,

    /// HTTP bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_namespace() -> String {
    "default".to_string()
}

fn default_ttl_ms() -> u64 {
    10_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/wolflease/leases.db")
}

fn default_api_address() -> String {
    "0.0.0.0:4040".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ElectionSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: None,
            namespace: default_namespace(),
            ttl_ms: default_ttl_ms(),
            renew_deadline_ms: None,
            retry_period_ms: None,
            backoff_max_ms: default_backoff_max_ms(),
            store_timeout_ms: None,
            release_on_shutdown: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfLeaseConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfLeaseConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfLeaseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.election.name.is_empty() {
            return Err(crate::Error::Config("election.name cannot be empty".into()));
        }

        if self.election.namespace.is_empty() {
            return Err(crate::Error::Config("election.namespace cannot be empty".into()));
        }

        if matches!(self.election.id.as_deref(), Some("")) {
            return Err(crate::Error::Config("election.id cannot be empty".into()));
        }

        if self.election.ttl_ms == 0 {
            return Err(crate::Error::Config("election.ttl_ms must be positive".into()));
        }

        self.election_config().validate()?;

        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("store.path cannot be empty".into()));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Fill in a generated identity if none is configured and return it
    pub fn resolve_identity(&mut self) -> &str {
        self.election.id.get_or_insert_with(default_identity)
    }

    /// Key of the contested lock record
    pub fn lock_key(&self) -> LockKey {
        LockKey::new(self.election.namespace.clone(), self.election.name.clone())
    }

    /// Get the lease TTL as Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.election.ttl_ms)
    }

    /// Build election timings, deriving unset values from the TTL
    pub fn election_config(&self) -> ElectionConfig {
        let mut config = ElectionConfig::from_ttl(self.ttl());

        if let Some(ms) = self.election.renew_deadline_ms {
            config.renew_deadline = Duration::from_millis(ms);
            config.store_timeout = config.renew_deadline;
        }
        if let Some(ms) = self.election.retry_period_ms {
            config.retry_period = Duration::from_millis(ms);
            config.backoff_base = config.retry_period;
        }
        if let Some(ms) = self.election.store_timeout_ms {
            config.store_timeout = Duration::from_millis(ms);
        }
        config.backoff_max = Duration::from_millis(self.election.backoff_max_ms).max(config.backoff_base);
        config.release_on_cancel = self.election.release_on_shutdown;

        config
    }
}

/// `<hostname>-<8 hex chars>`, unique per process start
pub fn default_identity() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "participant".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

/// Parse a duration such as `10s`, `500ms`, `2m` or `1h`. A bare number is
/// taken as seconds.
pub fn parse_duration(raw: &str) -> crate::Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);

    let value: f64 = value
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid duration {:?}", raw)))?;

    let seconds = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => {
            return Err(crate::Error::Config(format!(
                "invalid duration unit {:?} in {:?}",
                unit, raw
            )))
        }
    };

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(crate::Error::Config(format!("invalid duration {:?}", raw)));
    }

    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[election]
name = "scheduler"
id = "node-1"
namespace = "prod"
ttl_ms = 8000

[store]
backend = "sqlite"
path = "/tmp/wolflease/leases.db"

[api]
enabled = true
bind_address = "127.0.0.1:4040"

[logging]
format = "json"
"#;

        let config = WolfLeaseConfig::from_str(toml).unwrap();
        assert_eq!(config.election.name, "scheduler");
        assert_eq!(config.lock_key(), LockKey::new("prod", "scheduler"));
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert!(config.api.enabled);

        let timings = config.election_config();
        assert_eq!(timings.lease_duration, Duration::from_secs(8));
        assert_eq!(timings.renew_deadline, Duration::from_secs(4));
        assert_eq!(timings.retry_period, Duration::from_secs(2));
        assert!(timings.release_on_cancel);
    }

    #[test]
    fn test_missing_election_name() {
        let err = WolfLeaseConfig::from_str("[election]\nid = \"node-1\"\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_bad_timings_rejected() {
        let toml = r#"
[election]
name = "scheduler"
ttl_ms = 10000
renew_deadline_ms = 12000
"#;
        assert!(WolfLeaseConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_explicit_timings() {
        let toml = r#"
[election]
name = "scheduler"
ttl_ms = 10000
renew_deadline_ms = 6000
retry_period_ms = 1000
store_timeout_ms = 2000
backoff_max_ms = 500
"#;
        let config = WolfLeaseConfig::from_str(toml).unwrap();
        let timings = config.election_config();
        assert_eq!(timings.renew_deadline, Duration::from_secs(6));
        assert_eq!(timings.retry_period, Duration::from_secs(1));
        assert_eq!(timings.store_timeout, Duration::from_secs(2));
        // Never below the base
        assert_eq!(timings.backoff_max, Duration::from_secs(1));
    }

    #[test]
    fn test_resolve_identity() {
        let mut config = WolfLeaseConfig::default();
        let generated = config.resolve_identity().to_string();
        assert!(!generated.is_empty());
        assert_eq!(config.resolve_identity(), generated);

        config.election.id = Some("p1".to_string());
        assert_eq!(config.resolve_identity(), "p1");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("10d").is_err());
    }
}
