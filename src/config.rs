//! Configuration for the fetch pipeline.
//!
//! Two layers feed the pipeline:
//!
//! - An optional TOML file (`~/.config/feedguard/config.toml`) holding request
//!   defaults and pool/limit tuning. A missing file yields `Config::default()`.
//! - Process environment variables, read through [`EnvSource`] at the moment a
//!   decision is made (rate ceilings, production marker) and never cached, so a
//!   changed variable is honored on the next call.
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Per-minute request ceiling override.
pub const ENV_RATE_LIMIT_PER_MINUTE: &str = "FEEDGUARD_RATE_LIMIT_PER_MINUTE";
/// Per-hour request ceiling override.
pub const ENV_RATE_LIMIT_PER_HOUR: &str = "FEEDGUARD_RATE_LIMIT_PER_HOUR";
/// Deployment marker; `production` or `prod` vetoes TLS bypass.
pub const ENV_ENVIRONMENT: &str = "FEEDGUARD_ENVIRONMENT";

pub const DEFAULT_USER_AGENT: &str = concat!("feedguard/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_MAX_ITEMS: usize = 10;
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 1000;
pub const DEFAULT_CLIENT_POOL_CAPACITY: usize = 100;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024; // 10MB

// ============================================================================
// Environment Lookup
// ============================================================================

/// Source of environment values consulted at decision time.
///
/// Production code uses [`ProcessEnv`]; tests hand in a `HashMap` so they can
/// flip the production marker or ceilings without touching the real process
/// environment (which is shared by every test thread).
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Reads `key` and parses it, ignoring unset, blank or malformed values.
    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T>
    where
        Self: Sized,
    {
        parse_var(self.var(key), key)
    }
}

/// Reads the live process environment on every lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Parses an optional raw value, logging (not failing) on garbage.
pub(crate) fn parse_var<T: std::str::FromStr>(raw: Option<String>, key: &str) -> Option<T> {
    let raw = raw?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %trimmed, "Ignoring malformed environment value");
            None
        }
    }
}

/// Returns true when the deployment marker names a production environment.
pub fn is_production(env: &dyn EnvSource) -> bool {
    env.var(ENV_ENVIRONMENT)
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("production") || v.eq_ignore_ascii_case("prod")
        })
        .unwrap_or(false)
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration File
// ============================================================================

/// Pipeline defaults loaded from the config file.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// User-Agent sent when a request does not name one.
    pub user_agent: String,

    /// Per-attempt connect/read timeout in seconds.
    pub timeout_seconds: u64,

    /// Default cap on returned feed items.
    pub max_items: usize,

    /// Per-host per-minute ceiling. The environment variable wins when set.
    pub rate_limit_per_minute: Option<u32>,

    /// Per-host per-hour ceiling. The environment variable wins when set.
    pub rate_limit_per_hour: Option<u32>,

    /// Number of distinct client configurations kept alive.
    pub client_pool_capacity: usize,

    /// Upper bound on a response body.
    pub max_response_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_items: DEFAULT_MAX_ITEMS,
            rate_limit_per_minute: None,
            rate_limit_per_hour: None,
            client_pool_capacity: DEFAULT_CLIENT_POOL_CAPACITY,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "user_agent",
        "timeout_seconds",
        "max_items",
        "rate_limit_per_minute",
        "rate_limit_per_hour",
        "client_pool_capacity",
        "max_response_bytes",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            timeout_seconds = config.timeout_seconds,
            pool_capacity = config.client_pool_capacity,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
