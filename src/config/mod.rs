//! Configuration
//!
//! TOML-based configuration with environment-variable overrides
//! (`NIMBUSMQ_*` prefix) and `${VAR}` / `${VAR:-default}` substitution in
//! the file itself. Only the knobs the broker core consumes live here; the
//! embedding transport layer carries its own settings.

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config crate error (parse, merge, env)
    Config(config::ConfigError),
    /// Semantic validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Expand `${VAR}` and `${VAR:-fallback}` references against the process
/// environment. An unset variable becomes its fallback (or nothing); an
/// unterminated `${` is kept as-is.
fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let (name, fallback) = match after[..end].split_once(":-") {
            Some((name, fallback)) => (name, fallback),
            None => (&after[..end], ""),
        };
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(fallback),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub persistence: PersistenceConfig,
    pub sys: SysConfig,
}

impl Config {
    /// Load from a TOML file, applying env substitution then `NIMBUSMQ_*`
    /// overrides (e.g. `NIMBUSMQ_AUTH__ALLOW_ANONYMOUS=false`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let substituted = expand_env_vars(raw);
        let cfg: Config = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Environment::with_prefix("NIMBUSMQ").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.queue_bound == 0 {
            return Err(ConfigError::Validation(
                "session.queue_bound must be at least 1".to_string(),
            ));
        }
        if self.session.backlog_bound == 0 {
            return Err(ConfigError::Validation(
                "session.backlog_bound must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Install a global tracing subscriber honoring `RUST_LOG` when set
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

/// Session and queue configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Grace window for sessions whose Connect carried no
    /// Session-Expiry-Interval
    #[serde(with = "humantime_serde")]
    pub expiry_default: Duration,
    /// Per-session outbound packet queue bound
    pub queue_bound: usize,
    /// Per-session backlog bound (deliveries awaiting a flight token)
    pub backlog_bound: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_default: Duration::from_secs(300),
            queue_bound: 1000,
            backlog_bound: 1000,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Admit clients presenting no username
    pub allow_anonymous: bool,
    pub users: Vec<UserConfig>,
}

/// One user entry
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    /// Ordered rules, first match wins: `"allow sensors/#"`, `"deny #"`
    #[serde(default)]
    pub acl: Vec<String>,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Keyspace directory for the embedded store
    pub path: String,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "data".to_string(),
            flush_interval: Duration::from_secs(1),
            max_batch_size: 64,
        }
    }
}

/// `$SYS` publisher configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SysConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}
