//! Engine configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Timings used by the async reconciler and the services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// Requeue delay for in-progress operations without a better hint.
    #[serde(with = "duration_secs")]
    pub requeue_after: Duration,
    /// Cooldown applied to HTTP 429 responses without `Retry-After`.
    #[serde(rename = "http429RetryAfter", with = "duration_secs")]
    pub http429_retry_after: Duration,
    /// Upper bound for a single SDK call, polling included.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Deadline for one service's reconcile or delete. Calls are shortened to fit it.
    #[serde(with = "duration_secs")]
    pub service_reconcile_timeout: Duration,
    /// Requeue delay when a resource is not in a terminal provisioning state.
    #[serde(with = "duration_secs")]
    pub not_terminal_requeue: Duration,
}

impl ReconcilerConfig {
    pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(15);
    pub const DEFAULT_HTTP429_RETRY_AFTER: Duration = Duration::from_secs(60);
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_SERVICE_RECONCILE_TIMEOUT: Duration = Duration::from_secs(12);
    pub const DEFAULT_NOT_TERMINAL_REQUEUE: Duration = Duration::from_secs(20);
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            requeue_after: Self::DEFAULT_REQUEUE_AFTER,
            http429_retry_after: Self::DEFAULT_HTTP429_RETRY_AFTER,
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            service_reconcile_timeout: Self::DEFAULT_SERVICE_RECONCILE_TIMEOUT,
            not_terminal_requeue: Self::DEFAULT_NOT_TERMINAL_REQUEUE,
        }
    }
}

/// Top-level engine configuration, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub reconciler: ReconcilerConfig,
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub image_cache_capacity: usize,
}

impl EngineConfig {
    pub const DEFAULT_IMAGE_CACHE_CAPACITY: usize = 1024;

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "imageCacheCapacity must be at least 1".to_string(),
            ));
        }
        if self.reconciler.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("callTimeout must be positive".to_string()));
        }
        if self.reconciler.service_reconcile_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "serviceReconcileTimeout must be positive".to_string(),
            ));
        }
        for (service, limits) in &self.rate_limits {
            limits.validate(service)?;
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            rate_limits: HashMap::new(),
            image_cache_capacity: Self::DEFAULT_IMAGE_CACHE_CAPACITY,
        }
    }
}

/// Durations as (possibly fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config.reconciler.requeue_after, Duration::from_secs(15));
        assert_eq!(config.reconciler.http429_retry_after, Duration::from_secs(60));
        assert_eq!(config.reconciler.call_timeout, Duration::from_secs(2));
        assert_eq!(config.reconciler.service_reconcile_timeout, Duration::from_secs(12));
        assert_eq!(config.reconciler.not_terminal_requeue, Duration::from_secs(20));
        assert!(config.rate_limits.is_empty());
        assert_eq!(config.image_cache_capacity, 1024);
    }

    #[test]
    fn test_parse_full() {
        let yaml = r#"
reconciler:
  requeueAfter: 5
  http429RetryAfter: 30
  callTimeout: 0.5
rateLimits:
  privateendpoints:
    enabled: true
    readQPS: 10
    readBucket: 100
    writeQPS: 5
    writeBucket: 10
    deleteQPS: 1
    deleteBucket: 1
imageCacheCapacity: 16
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.reconciler.requeue_after, Duration::from_secs(5));
        assert_eq!(config.reconciler.http429_retry_after, Duration::from_secs(30));
        assert_eq!(config.reconciler.call_timeout, Duration::from_millis(500));
        assert_eq!(config.reconciler.not_terminal_requeue, Duration::from_secs(20));
        assert_eq!(config.image_cache_capacity, 16);
        let limits = &config.rate_limits["privateendpoints"];
        assert!(limits.enabled);
        assert_eq!(limits.write_bucket, 10);
    }

    #[test]
    fn test_rejects_invalid() {
        let err = EngineConfig::from_yaml("imageCacheCapacity: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_yaml("rateLimits:\n  svc:\n    enabled: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_yaml("reconciler:\n  requeueAfter: -1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        // Disabled limits are not validated.
        assert!(EngineConfig::from_yaml("rateLimits:\n  svc:\n    enabled: false\n").is_ok());
    }

    #[test]
    fn test_serialize_uses_seconds() {
        let yaml = serde_yaml::to_string(&EngineConfig::default()).unwrap();
        assert!(yaml.contains("requeueAfter: 15"), "{yaml}");
        assert!(yaml.contains("http429RetryAfter: 60"), "{yaml}");
        assert!(yaml.contains("imageCacheCapacity: 1024"), "{yaml}");
    }
}
