//! Client-side rate limiting and `Retry-After` handling.
//!
//! One [`OperationLimiter`] exists per (service, operation class). It refuses
//! requests when its token bucket is empty or while a cooldown stored from a
//! previous HTTP 429 is still running.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cloud::{CloudError, OperationClass};
use crate::config::ConfigError;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-service limiter settings. Everything is optional; the default is disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(rename = "readQPS")]
    pub read_qps: f32,
    pub read_bucket: u32,
    #[serde(rename = "writeQPS")]
    pub write_qps: f32,
    pub write_bucket: u32,
    #[serde(rename = "deleteQPS")]
    pub delete_qps: f32,
    pub delete_bucket: u32,
}

impl RateLimitConfig {
    /// Reject enabled configs whose buckets could never hand out a token.
    pub fn validate(&self, service: &str) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        for (class, qps, bucket) in [
            (OperationClass::Read, self.read_qps, self.read_bucket),
            (OperationClass::Write, self.write_qps, self.write_bucket),
            (OperationClass::Delete, self.delete_qps, self.delete_bucket),
        ] {
            if !(qps.is_finite() && qps > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "rate limit for {service} {class}: qps must be positive, got {qps}"
                )));
            }
            if bucket == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate limit for {service} {class}: bucket must be at least 1"
                )));
            }
        }
        Ok(())
    }

    fn class_settings(&self, class: OperationClass) -> (f32, u32) {
        match class {
            OperationClass::Read => (self.read_qps, self.read_bucket),
            OperationClass::Write => (self.write_qps, self.write_bucket),
            OperationClass::Delete => (self.delete_qps, self.delete_bucket),
        }
    }
}

/// Token bucket plus `Retry-After` cooldown for one operation class.
pub struct OperationLimiter {
    service: String,
    class: OperationClass,
    bucket: Option<Bucket>,
    retry_after: Mutex<Option<DateTime<Utc>>>,
}

impl OperationLimiter {
    fn new(service: &str, class: OperationClass, config: &RateLimitConfig) -> Self {
        let bucket = if config.enabled {
            let (qps, burst) = config.class_settings(class);
            build_bucket(qps, burst)
        } else {
            None
        };

        Self {
            service: service.to_string(),
            class,
            bucket,
            retry_after: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Fail fast when the bucket is empty or a cooldown is running.
    pub fn try_request(&self) -> Result<(), CloudError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        let now = Utc::now();
        if let Some(until) = self.cooldown_until() {
            if until > now {
                debug!(
                    service = %self.service,
                    class = %self.class,
                    until = %until,
                    "Request refused, server cooldown still active"
                );
                return Err(self.refused(Some(until)));
            }
        }

        if bucket.check().is_err() {
            debug!(service = %self.service, class = %self.class, "Request refused, bucket empty");
            return Err(self.refused(None));
        }
        Ok(())
    }

    /// Record the cooldown requested by a throttled response.
    ///
    /// Only HTTP 429 responses are considered. A missing or malformed
    /// `Retry-After` header falls back to `fallback`.
    pub fn store_retry_after(&self, err: &CloudError, fallback: Duration) {
        if self.bucket.is_none() {
            return;
        }
        let CloudError::Response(response) = err else {
            return;
        };
        if response.status != StatusCode::TOO_MANY_REQUESTS {
            return;
        }

        let now = Utc::now();
        let delay = response
            .retry_after()
            .and_then(|value| parse_retry_after(value, now))
            .unwrap_or(fallback);
        let Some(until) = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
        else {
            warn!(service = %self.service, ?delay, "Ignoring out of range Retry-After");
            return;
        };

        let mut stored = self.lock_retry_after();
        if stored.map_or(true, |current| current < until) {
            debug!(service = %self.service, class = %self.class, until = %until, "Storing server cooldown");
            *stored = Some(until);
        }
    }

    /// End of the stored cooldown, if any.
    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        *self.lock_retry_after()
    }

    fn refused(&self, retry_at: Option<DateTime<Utc>>) -> CloudError {
        CloudError::RateLimited {
            service: self.service.clone(),
            class: self.class,
            retry_at,
        }
    }

    fn lock_retry_after(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.retry_after
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn build_bucket(qps: f32, burst: u32) -> Option<Bucket> {
    let burst = NonZeroU32::new(burst)?;
    if !(qps.is_finite() && qps > 0.0) {
        return None;
    }
    let period = Duration::from_secs_f64(1.0 / f64::from(qps));
    let quota = Quota::with_period(period)?.allow_burst(burst);
    Some(RateLimiter::direct(quota))
}

/// The three limiters of one service.
pub struct ServiceLimiter {
    pub read: OperationLimiter,
    pub write: OperationLimiter,
    pub delete: OperationLimiter,
}

impl ServiceLimiter {
    pub fn new(service: &str, config: &RateLimitConfig) -> Self {
        Self {
            read: OperationLimiter::new(service, OperationClass::Read, config),
            write: OperationLimiter::new(service, OperationClass::Write, config),
            delete: OperationLimiter::new(service, OperationClass::Delete, config),
        }
    }

    pub fn disabled(service: &str) -> Self {
        Self::new(service, &RateLimitConfig::default())
    }

    pub fn for_class(&self, class: OperationClass) -> &OperationLimiter {
        match class {
            OperationClass::Read => &self.read,
            OperationClass::Write => &self.write,
            OperationClass::Delete => &self.delete,
        }
    }
}

/// Process-wide limiter registry keyed by service name.
#[derive(Default)]
pub struct RateLimiters {
    services: HashMap<String, Arc<ServiceLimiter>>,
}

impl RateLimiters {
    pub fn new(configs: &HashMap<String, RateLimitConfig>) -> Result<Self, ConfigError> {
        let mut services = HashMap::new();
        for (service, config) in configs {
            config.validate(service)?;
            services.insert(service.clone(), Arc::new(ServiceLimiter::new(service, config)));
        }
        Ok(Self { services })
    }

    /// Limiter for `service`; services without configuration get a disabled one.
    pub fn for_service(&self, service: &str) -> Arc<ServiceLimiter> {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(|| Arc::new(ServiceLimiter::disabled(service)))
    }
}

/// Parse a `Retry-After` value.
///
/// Accepts delay-seconds (`"42"`) and HTTP dates
/// (`"Wed, 21 Oct 2015 07:28:00 GMT"`). Zero and dates that have passed
/// carry no usable delay and yield `None`, so callers fall back to their
/// default instead of retrying immediately.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    let delay = match value.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
            (at - now).to_std().ok()?
        }
    };
    (!delay.is_zero()).then_some(delay)
}

/// Requeue delay for a failed cloud call.
///
/// Uses the response's `Retry-After` when present and valid, `default_429`
/// for throttled responses without one, and `default` otherwise.
pub fn retry_after_from_error(
    err: &CloudError,
    default: Duration,
    default_429: Duration,
) -> Duration {
    match err {
        CloudError::Response(response) => {
            if let Some(delay) = response
                .retry_after()
                .and_then(|value| parse_retry_after(value, Utc::now()))
            {
                return delay;
            }
            if response.status == StatusCode::TOO_MANY_REQUESTS {
                default_429
            } else {
                default
            }
        }
        CloudError::RateLimited {
            retry_at: Some(at), ..
        } => (*at - Utc::now())
            .to_std()
            .ok()
            .filter(|remaining| !remaining.is_zero())
            .unwrap_or(default),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ResponseError;
    use chrono::TimeZone;
    use http::header::RETRY_AFTER;

    fn enabled(bucket: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            read_qps: 0.001,
            read_bucket: bucket,
            write_qps: 0.001,
            write_bucket: bucket,
            delete_qps: 0.001,
            delete_bucket: bucket,
        }
    }

    fn throttled(retry_after: Option<&str>) -> CloudError {
        let mut response = ResponseError::new(StatusCode::TOO_MANY_REQUESTS, "TooManyRequests", "slow down");
        if let Some(value) = retry_after {
            response = response.with_header(RETRY_AFTER, value);
        }
        CloudError::Response(response)
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("42", now), Some(Duration::from_secs(42)));
        assert_eq!(parse_retry_after(" 7 ", now), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("0", now), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        // Already elapsed.
        let later = Utc.with_ymd_and_hms(2015, 10, 21, 8, 0, 0).unwrap();
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", later), None);
    }

    #[test]
    fn test_parse_retry_after_malformed() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-5", now), None);
        assert_eq!(parse_retry_after("", now), None);
    }

    #[test]
    fn test_retry_after_from_error() {
        let default = Duration::from_secs(15);
        let default_429 = Duration::from_secs(60);

        assert_eq!(
            retry_after_from_error(&throttled(Some("17")), default, default_429),
            Duration::from_secs(17)
        );
        assert_eq!(
            retry_after_from_error(&throttled(None), default, default_429),
            default_429
        );
        assert_eq!(
            retry_after_from_error(&throttled(Some("garbage")), default, default_429),
            default_429
        );

        // No hot loop on a zero or elapsed hint.
        assert_eq!(
            retry_after_from_error(&throttled(Some("0")), default, default_429),
            default_429
        );
        assert_eq!(
            retry_after_from_error(
                &throttled(Some("Wed, 21 Oct 2015 07:28:00 GMT")),
                default,
                default_429
            ),
            default_429
        );

        let unavailable = CloudError::Response(ResponseError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "ServiceUnavailable",
            "down",
        ));
        assert_eq!(retry_after_from_error(&unavailable, default, default_429), default);
        assert_eq!(
            retry_after_from_error(&CloudError::Timeout(Duration::from_secs(2)), default, default_429),
            default
        );
    }

    #[test]
    fn test_disabled_limiter_never_refuses() {
        let limiter = ServiceLimiter::disabled("svc");
        for _ in 0..100 {
            limiter.read.try_request().unwrap();
        }
        limiter.write.store_retry_after(&throttled(Some("3600")), Duration::from_secs(60));
        assert!(limiter.write.cooldown_until().is_none());
        assert!(limiter.write.try_request().is_ok());
    }

    #[test]
    fn test_bucket_exhaustion() {
        let limiter = ServiceLimiter::new("svc", &enabled(2));
        assert!(limiter.read.try_request().is_ok());
        assert!(limiter.read.try_request().is_ok());
        let err = limiter.read.try_request().unwrap_err();
        assert!(matches!(
            err,
            CloudError::RateLimited { class: OperationClass::Read, retry_at: None, .. }
        ));
        assert!(err.is_retriable());

        // Classes have independent buckets.
        assert!(limiter.delete.try_request().is_ok());
    }

    #[test]
    fn test_zero_retry_after_cools_down_for_fallback() {
        let limiter = ServiceLimiter::new("svc", &enabled(10));
        limiter.write.store_retry_after(&throttled(Some("0")), Duration::from_secs(60));

        let until = limiter.write.cooldown_until().unwrap();
        let remaining = (until - Utc::now()).num_seconds();
        assert!((58..=60).contains(&remaining), "{remaining}");
        assert!(limiter.write.try_request().is_err());
    }

    #[test]
    fn test_cooldown_blocks_requests() {
        let limiter = ServiceLimiter::new("svc", &enabled(10));
        limiter.write.store_retry_after(&throttled(Some("30")), Duration::from_secs(60));

        let until = limiter.write.cooldown_until().unwrap();
        let remaining = (until - Utc::now()).num_seconds();
        assert!((28..=30).contains(&remaining), "{remaining}");

        match limiter.write.try_request() {
            Err(CloudError::RateLimited { retry_at, .. }) => assert_eq!(retry_at, Some(until)),
            other => panic!("expected rate limited, got {other:?}"),
        }
        assert!(limiter.read.try_request().is_ok());
    }

    #[test]
    fn test_cooldown_fallback_and_non_throttle() {
        let limiter = ServiceLimiter::new("svc", &enabled(10));

        let conflict = CloudError::Response(
            ResponseError::new(StatusCode::CONFLICT, "Conflict", "busy").with_header(RETRY_AFTER, "30"),
        );
        limiter.write.store_retry_after(&conflict, Duration::from_secs(60));
        assert!(limiter.write.cooldown_until().is_none());

        limiter.write.store_retry_after(&throttled(None), Duration::from_secs(60));
        let remaining = (limiter.write.cooldown_until().unwrap() - Utc::now()).num_seconds();
        assert!((58..=60).contains(&remaining), "{remaining}");

        // A shorter cooldown never shortens the stored one.
        limiter.write.store_retry_after(&throttled(Some("1")), Duration::from_secs(60));
        let remaining = (limiter.write.cooldown_until().unwrap() - Utc::now()).num_seconds();
        assert!(remaining >= 58, "{remaining}");
    }

    #[test]
    fn test_rate_limited_error_requeues_until_cooldown() {
        let limiter = ServiceLimiter::new("svc", &enabled(10));
        limiter.write.store_retry_after(&throttled(Some("40")), Duration::from_secs(60));
        let err = limiter.write.try_request().unwrap_err();

        let delay = retry_after_from_error(&err, Duration::from_secs(15), Duration::from_secs(60));
        assert!(delay > Duration::from_secs(38) && delay <= Duration::from_secs(40), "{delay:?}");
    }

    #[test]
    fn test_registry_validates_and_defaults() {
        let mut configs = HashMap::new();
        configs.insert("privateendpoints".to_string(), enabled(5));
        let limiters = RateLimiters::new(&configs).unwrap();
        assert!(limiters.for_service("privateendpoints").read.is_enabled());
        assert!(!limiters.for_service("agentpools").read.is_enabled());

        let mut bad = enabled(5);
        bad.write_bucket = 0;
        configs.insert("securitygroups".to_string(), bad);
        assert!(matches!(RateLimiters::new(&configs), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_keys() {
        let config: RateLimitConfig = serde_yaml::from_str(
            "enabled: true\nreadQPS: 10.5\nreadBucket: 20\nwriteQPS: 2\nwriteBucket: 4\n",
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.read_qps, 10.5);
        assert_eq!(config.read_bucket, 20);
        assert_eq!(config.write_qps, 2.0);
        assert_eq!(config.delete_bucket, 0);
    }
}
