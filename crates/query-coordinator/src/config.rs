use std::{collections::BTreeMap, path::Path, time::Duration};

use crate::{cache::FetchPolicy, policy::ErrorPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// How long an operation nobody subscribes to anymore is kept alive before its
    /// transport is stopped. A subscriber arriving in the meantime reuses it.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub teardown_delay: Duration,
    /// Identical operations share one transport subscription.
    pub deduplication: bool,
    pub error_policy: ErrorPolicy,
    pub fetch_policy: FetchPolicy,
    pub cache: CacheConfig,
    pub http: Option<HttpConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            teardown_delay: Duration::from_millis(10),
            deduplication: true,
            error_policy: ErrorPolicy::default(),
            fetch_policy: FetchPolicy::default(),
            cache: CacheConfig::default(),
            http: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Fields identifying an entity together with its `__typename`, first match wins.
    pub key_fields: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            key_fields: vec!["id".to_string(), "_id".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    pub url: url::Url,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
