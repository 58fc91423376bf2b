use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CloudError, Creator, Deleter, Lro, Pauser, ResourceSpec};
use crate::ratelimit::{OperationLimiter, ServiceLimiter};

/// Puts a service's client-side limiters in front of any cloud client.
///
/// Reads, writes and deletes draw from their own buckets. Every error seen
/// is offered to the limiter so HTTP 429 cooldowns apply to later calls.
pub struct RateLimitedClient<C> {
    inner: C,
    limiter: Arc<ServiceLimiter>,
    fallback: Duration,
}

impl<C> RateLimitedClient<C> {
    /// `fallback` is the cooldown for 429 responses without `Retry-After`.
    pub fn new(inner: C, limiter: Arc<ServiceLimiter>, fallback: Duration) -> Self {
        Self {
            inner,
            limiter,
            fallback,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn limiter(&self) -> &ServiceLimiter {
        &self.limiter
    }

    fn observe<T, P>(&self, limiter: &OperationLimiter, lro: &Lro<T, P>) {
        match lro {
            Lro::Failed(err)
            | Lro::Pending {
                cause: Some(err), ..
            } => limiter.store_retry_after(err, self.fallback),
            _ => {}
        }
    }
}

#[async_trait]
impl<S, C> Creator<S> for RateLimitedClient<C>
where
    S: ResourceSpec,
    C: Creator<S>,
{
    type Poller = C::Poller;

    async fn get(&self, spec: &S) -> Result<S::Resource, CloudError> {
        self.limiter.read.try_request()?;
        let result = self.inner.get(spec).await;
        if let Err(err) = &result {
            self.limiter.read.store_retry_after(err, self.fallback);
        }
        result
    }

    async fn create_or_update_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        parameters: S::Resource,
        timeout: Duration,
    ) -> Lro<S::Resource, Self::Poller> {
        if let Err(err) = self.limiter.write.try_request() {
            return Lro::Failed(err);
        }
        let lro = self
            .inner
            .create_or_update_async(spec, resume_token, parameters, timeout)
            .await;
        self.observe(&self.limiter.write, &lro);
        lro
    }
}

#[async_trait]
impl<S, C> Deleter<S> for RateLimitedClient<C>
where
    S: ResourceSpec,
    C: Deleter<S>,
{
    type Poller = C::Poller;

    async fn delete_async(
        &self,
        spec: &S,
        resume_token: Option<String>,
        timeout: Duration,
    ) -> Lro<(), Self::Poller> {
        if let Err(err) = self.limiter.delete.try_request() {
            return Lro::Failed(err);
        }
        let lro = self.inner.delete_async(spec, resume_token, timeout).await;
        self.observe(&self.limiter.delete, &lro);
        lro
    }
}

#[async_trait]
impl<S, C> Pauser<S> for RateLimitedClient<C>
where
    S: ResourceSpec,
    C: Pauser<S>,
{
    async fn pause(&self, spec: &S) -> Result<(), CloudError> {
        self.limiter.write.try_request()?;
        let result = self.inner.pause(spec).await;
        if let Err(err) = &result {
            self.limiter.write.store_retry_after(err, self.fallback);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use http::header::RETRY_AFTER;
    use http::StatusCode;
    use serde_json::{json, Value};

    use super::*;
    use crate::cloud::memory::{InMemoryCloud, SimSpec};
    use crate::cloud::{OperationClass, ResponseError};
    use crate::ratelimit::RateLimitConfig;

    fn limited(bucket: u32) -> RateLimitedClient<InMemoryCloud<Value>> {
        let config = RateLimitConfig {
            enabled: true,
            read_qps: 0.001,
            read_bucket: bucket,
            write_qps: 0.001,
            write_bucket: bucket,
            delete_qps: 0.001,
            delete_bucket: bucket,
        };
        RateLimitedClient::new(
            InMemoryCloud::new(0),
            Arc::new(ServiceLimiter::new("svc", &config)),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_empty_bucket_refuses_without_calling_cloud() {
        let client = limited(1);
        let spec = SimSpec::new("g1", "r1", json!({"a": 1}));

        assert!(client.get(&spec).await.unwrap_err().is_not_found());
        let err = client.get(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            CloudError::RateLimited { class: OperationClass::Read, .. }
        ));
        assert_eq!(client.inner().calls().gets, 1);
    }

    #[tokio::test]
    async fn test_throttled_write_starts_cooldown() {
        let client = limited(10);
        client.inner().inject_fault(
            OperationClass::Write,
            CloudError::Response(
                ResponseError::new(StatusCode::TOO_MANY_REQUESTS, "TooManyRequests", "slow down")
                    .with_header(RETRY_AFTER, "120"),
            ),
        );
        let spec = SimSpec::new("g1", "r1", json!({"a": 1}));

        let first = client
            .create_or_update_async(&spec, None, json!({"a": 1}), Duration::from_secs(2))
            .await;
        assert!(matches!(first, Lro::Failed(ref err) if err.status() == Some(StatusCode::TOO_MANY_REQUESTS)));

        let second = client
            .create_or_update_async(&spec, None, json!({"a": 1}), Duration::from_secs(2))
            .await;
        match second {
            Lro::Failed(CloudError::RateLimited { retry_at, .. }) => assert!(retry_at.is_some()),
            other => panic!("expected cooldown refusal, got {other:?}"),
        }
        assert_eq!(client.inner().calls().puts, 1);

        // Reads are not affected by the write cooldown.
        assert!(client.get(&spec).await.unwrap_err().is_not_found());
    }
}
