//! Cache and transport configuration

use serde::Deserialize;
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};

use crate::CacheError;

/// How long populated entries stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Nothing is stored; every lookup calls the populate function.
    Disabled,
    /// Entries expire this long after they were populated.
    After(Duration),
}

/// Longest expiration the in-memory store accepts (1000 years)
pub const MAX_EXPIRY: Duration = Duration::from_secs(1000 * 365 * 24 * 60 * 60);

impl Expiry {
    /// Build from a minute count where `-1` (or any negative value) disables caching.
    pub fn from_minutes(minutes: i64) -> Result<Self, CacheError> {
        if minutes < 0 {
            return Ok(Expiry::Disabled);
        }
        let expiry = (minutes as u64)
            .checked_mul(60)
            .map(|secs| Expiry::After(Duration::from_secs(secs)))
            .ok_or_else(|| {
                CacheError::configuration("CacheConfig", format!("expiry of {} minutes overflows", minutes))
            })?;
        expiry.validate()?;
        Ok(expiry)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Expiry::Disabled)
    }

    /// Reject expirations beyond [`MAX_EXPIRY`].
    pub fn validate(&self) -> Result<(), CacheError> {
        match self {
            Expiry::After(ttl) if *ttl > MAX_EXPIRY => Err(CacheError::configuration(
                "CacheConfig",
                format!("expiry of {:?} exceeds the maximum of {:?}", ttl, MAX_EXPIRY),
            )),
            _ => Ok(()),
        }
    }
}

/// Configuration for the local cache and its owning service
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Expiration applied to every populated entry
    pub expiry: Expiry,
    /// Maximum number of entries held in memory
    pub max_capacity: u64,
    /// Delay before a disconnected transport is asked to connect again
    pub reconnect_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry: Expiry::After(Duration::from_secs(DEFAULT_CACHE_EXPIRY_MINUTES as u64 * 60)),
            max_capacity: DEFAULT_MAX_CAPACITY,
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
        }
    }
}

const DEFAULT_CACHE_EXPIRY_MINUTES: i64 = 5;
const DEFAULT_MAX_CAPACITY: u64 = 10_000;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Named key/value settings for one transport. Keys are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "HashMap<String, toml::Value>")]
pub struct TransportSettings {
    values: HashMap<String, String>,
}

impl From<HashMap<String, toml::Value>> for TransportSettings {
    fn from(raw: HashMap<String, toml::Value>) -> Self {
        let mut settings = TransportSettings::default();
        for (key, value) in raw {
            let value = match value {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            settings.insert(&key, value);
        }
        settings
    }
}

impl TransportSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_ascii_lowercase(), value.into());
    }

    /// Look up a setting. Empty values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Look up a required setting, failing with a configuration error naming `component`.
    pub fn require(&self, component: &str, key: &str) -> Result<&str, CacheError> {
        self.get(key)
            .ok_or_else(|| CacheError::configuration(component, format!("{} is unconfigured.", key)))
    }

    pub fn get_parsed<T>(&self, component: &str, key: &str) -> Result<Option<T>, CacheError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                CacheError::configuration(component, format!("invalid {} \"{}\": {}", key, raw, e))
            }),
            None => Ok(None),
        }
    }

    /// Read a millisecond setting as a duration.
    pub fn duration_ms(
        &self,
        component: &str,
        key: &str,
        default: Duration,
    ) -> Result<Duration, CacheError> {
        Ok(self
            .get_parsed::<u64>(component, key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }
}

/// Which transport backend a service instance uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// No transport: nothing is broadcast and caching is disabled
    #[default]
    None,
    /// Process-local push channel
    InProcess,
    /// Client of a relay broker
    RelayLeaf,
    /// The relay broker itself, participating as a node
    RelayBroker,
    /// Redis pub/sub topic
    RedisTopic,
}

/// Transport selection plus its settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub settings: TransportSettings,
}

/// Service configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Minutes before cached entries expire; `-1` disables caching
    #[serde(default = "default_cache_expiry")]
    pub default_cache_expiry: i64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_cache_expiry() -> i64 {
    DEFAULT_CACHE_EXPIRY_MINUTES
}

fn default_max_capacity() -> u64 {
    DEFAULT_MAX_CAPACITY
}

fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_cache_expiry: DEFAULT_CACHE_EXPIRY_MINUTES,
            max_capacity: DEFAULT_MAX_CAPACITY,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            transport: TransportConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a TOML configuration string.
    pub fn from_toml(content: &str) -> Result<Self, CacheError> {
        toml::from_str(content).map_err(|e| CacheError::Config(e.to_string()))
    }

    /// The cache settings of this file. Out-of-range expirations are a
    /// configuration error.
    pub fn cache_config(&self) -> Result<CacheConfig, CacheError> {
        Ok(CacheConfig {
            expiry: Expiry::from_minutes(self.default_cache_expiry)?,
            max_capacity: self.max_capacity,
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        })
    }
}
