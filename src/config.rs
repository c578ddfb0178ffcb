//! Configuration management for Storegate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::counter::{Backoff, Jitter, RetryPolicy};
use crate::error::{Result, StoregateError};
use crate::ratelimit::{AdmissionRule, AdmissionRules, DEFAULT_KEY_PREFIX};
use crate::store::RedisStoreConfig;

/// Prefix for environment variable overrides, e.g. `STOREGATE__STORE__URL`.
pub const ENV_PREFIX: &str = "STOREGATE";

/// Main configuration for Storegate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoregateConfig {
    /// Shared store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission gate configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Optimistic counter configuration
    #[serde(default)]
    pub counter: CounterConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Timeout for opening a transaction connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

/// Admission gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix for quota keys in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Path to a YAML rules file; takes precedence over `rules`
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline rules, in evaluation order
    #[serde(default)]
    pub rules: Option<Vec<AdmissionRule>>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            rules_path: None,
            rules: None,
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Backoff shape between optimistic attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Optimistic counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Total commit attempts per update
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff shape
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Base delay between attempts, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Cap for exponential backoff, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jitter applied to each delay
    #[serde(default)]
    pub jitter: Jitter,

    /// Key namespace for resource counters
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Counter name within a resource
    #[serde(default = "default_counter_name")]
    pub name: String,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: Jitter::default(),
            namespace: default_namespace(),
            name: default_counter_name(),
        }
    }
}

fn default_max_attempts() -> u32 {
    crate::counter::DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    crate::counter::DEFAULT_BACKOFF.as_millis() as u64
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_namespace() -> String {
    crate::counter::DEFAULT_NAMESPACE.to_string()
}

fn default_counter_name() -> String {
    crate::counter::DEFAULT_COUNTER_NAME.to_string()
}

impl CounterConfig {
    /// Build the retry policy described by this section.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let base = Duration::from_millis(self.backoff_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(self.max_backoff_ms),
            },
        };

        let policy = RetryPolicy {
            max_attempts: self.max_attempts,
            backoff,
            jitter: self.jitter,
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl StoregateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: StoregateConfig =
            serde_yaml::from_str(yaml).map_err(|e| StoregateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then the optional file, then `STOREGATE__*` environment
    /// variables, later sources winning.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(Path::new(path)));
        }

        let config: StoregateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        self.counter.retry_policy()?;
        if let Some(ref rules) = self.rate_limiting.rules {
            AdmissionRules::new(rules.clone())?;
        }
        Ok(())
    }

    /// Resolve the admission rules: rules file, then inline rules, then defaults.
    pub fn admission_rules(&self) -> Result<AdmissionRules> {
        if let Some(ref path) = self.rate_limiting.rules_path {
            return AdmissionRules::from_file(path);
        }
        match self.rate_limiting.rules {
            Some(ref rules) => AdmissionRules::new(rules.clone()),
            None => Ok(AdmissionRules::default()),
        }
    }

    /// Connection settings for [`RedisStore`](crate::store::RedisStore).
    pub fn redis_store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.store.url.clone(),
            connect_timeout: Duration::from_millis(self.store.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::IdentifierSource;

    #[test]
    fn test_defaults() {
        let config = StoregateConfig::default();
        assert_eq!(config.store.url, "redis://127.0.0.1:6379/");
        assert_eq!(config.rate_limiting.key_prefix, "rate_limit:");
        assert_eq!(config.counter.max_attempts, 5);

        let policy = config.counter.retry_policy().unwrap();
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_millis(100)));
        assert_eq!(policy.jitter, Jitter::None);

        assert_eq!(config.admission_rules().unwrap(), AdmissionRules::default());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
counter:
  max_attempts: 15
  backoff: exponential
  backoff_ms: 50
  max_backoff_ms: 400
  jitter: equal
"#;
        let config = StoregateConfig::from_yaml(yaml).unwrap();
        let policy = config.counter.retry_policy().unwrap();
        assert_eq!(policy.max_attempts, 15);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(50),
                max: Duration::from_millis(400)
            }
        );
        assert_eq!(policy.jitter, Jitter::Equal);
        assert_eq!(config.store.url, "redis://127.0.0.1:6379/");
    }

    #[test]
    fn test_inline_rules() {
        let yaml = r#"
rate_limiting:
  key_prefix: "quota:"
  rules:
    - dimension: ip
      source: caller
      limit: 3
      window_secs: 60
"#;
        let config = StoregateConfig::from_yaml(yaml).unwrap();
        let rules = config.admission_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules[0].source, IdentifierSource::Caller);
        assert_eq!(config.rate_limiting.key_prefix, "quota:");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let yaml = "counter:\n  max_attempts: 0\n";
        assert!(matches!(
            StoregateConfig::from_yaml(yaml),
            Err(StoregateError::Config(_))
        ));
    }

    #[test]
    fn test_rules_file_takes_precedence() {
        let dir = std::env::temp_dir().join(format!("storegate-rules-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rules.yaml");
        std::fs::write(
            &path,
            "- dimension: customer\n  source: tenant\n  limit: 2\n  window_secs: 10\n",
        )
        .unwrap();

        let mut config = StoregateConfig::default();
        config.rate_limiting.rules_path = Some(path.to_string_lossy().into_owned());

        let rules = config.admission_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules[0].quota.dimension, "customer");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("storegate-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("storegate.yaml");
        std::fs::write(&path, "store:\n  url: redis://cache:6379/\ncounter:\n  max_attempts: 9\n")
            .unwrap();

        let config = StoregateConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.store.url, "redis://cache:6379/");
        assert_eq!(config.counter.max_attempts, 9);
        assert_eq!(config.counter.backoff_ms, 100);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_redis_store_config() {
        let config = StoregateConfig::default();
        let redis = config.redis_store_config();
        assert_eq!(redis.url, config.store.url);
        assert_eq!(redis.connect_timeout, Duration::from_secs(2));
    }
}
