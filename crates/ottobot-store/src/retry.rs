//! Retry wrapper for store backends.
//!
//! Transport errors are retried with exponential backoff capped at two
//! seconds; everything else surfaces immediately. Wraps any [`Store`] and
//! implements the same trait, so callers never know whether they hold the
//! raw backend or the reliable one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Store, StoreError, StoreResult, Subscription};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn normalized(self) -> Self {
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.backoff_base
        };
        let backoff_max = self.backoff_max.max(backoff_base);
        Self {
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1_u128 << shift;
        let base = self.backoff_base.as_millis();
        let max = self.backoff_max.as_millis();
        let delay_ms = base.saturating_mul(factor).min(max);
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }
}

pub struct ReliableStore {
    inner: Arc<dyn Store>,
    policy: RetryPolicy,
}

impl ReliableStore {
    pub fn with_defaults(inner: Arc<dyn Store>) -> Self {
        Self::new(inner, RetryPolicy::default())
    }

    pub fn new(inner: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy: policy.normalized(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn run<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1_u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retriable = matches!(error, StoreError::Transport(_));
                    if !retriable || attempt >= self.policy.max_attempts {
                        return Err(error);
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying store operation after transport failure"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Store for ReliableStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run(|| self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.run(|| self.inner.set(key, value)).await
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.run(|| self.inner.setex(key, value, ttl)).await
    }

    async fn setnx(&self, key: &str, value: &str) -> StoreResult<bool> {
        // Not retried: a transport error after the backend applied the write
        // would turn one logical claim into a spurious loss for the caller.
        self.inner.setnx(key, value).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.run(|| self.inner.del(key)).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.inner.incr(key).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.run(|| self.inner.ttl(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.run(|| self.inner.expire(key, ttl)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.run(|| self.inner.sadd(key, member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        // Same reasoning as setnx: srem doubles as an atomic claim.
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.run(|| self.inner.smembers(key)).await
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        self.run(|| self.inner.scard(key)).await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.run(|| self.inner.rpush(key, value)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.run(|| self.inner.lrange(key, start, stop)).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        self.run(|| self.inner.ltrim(key, start, stop)).await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.run(|| self.inner.keys(pattern)).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize> {
        self.run(|| self.inner.publish(channel, payload)).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.run(|| self.inner.subscribe(channel)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::MemoryStore;

    /// Fails the first `failures` calls with a transport error, then
    /// delegates to an in-process backend.
    struct FlakyStore {
        inner: MemoryStore,
        remaining_failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                remaining_failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transport("injected".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.trip()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.trip()?;
            self.inner.set(key, value).await
        }
        async fn setex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.trip()?;
            self.inner.setex(key, value, ttl).await
        }
        async fn setnx(&self, key: &str, value: &str) -> StoreResult<bool> {
            self.trip()?;
            self.inner.setnx(key, value).await
        }
        async fn del(&self, key: &str) -> StoreResult<bool> {
            self.trip()?;
            self.inner.del(key).await
        }
        async fn incr(&self, key: &str) -> StoreResult<i64> {
            self.trip()?;
            self.inner.incr(key).await
        }
        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.trip()?;
            self.inner.ttl(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.trip()?;
            self.inner.expire(key, ttl).await
        }
        async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.trip()?;
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.trip()?;
            self.inner.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
            self.trip()?;
            self.inner.smembers(key).await
        }
        async fn scard(&self, key: &str) -> StoreResult<usize> {
            self.trip()?;
            self.inner.scard(key).await
        }
        async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
            self.trip()?;
            self.inner.rpush(key, value).await
        }
        async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
            self.trip()?;
            self.inner.lrange(key, start, stop).await
        }
        async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
            self.trip()?;
            self.inner.ltrim(key, start, stop).await
        }
        async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
            self.trip()?;
            self.inner.keys(pattern).await
        }
        async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize> {
            self.trip()?;
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
            self.trip()?;
            self.inner.subscribe(channel).await
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn recovers_from_transient_transport_failures() {
        let flaky = Arc::new(FlakyStore::new(2));
        let calls = |s: &Arc<FlakyStore>| s.calls.load(Ordering::SeqCst);
        let store = ReliableStore::new(flaky.clone() as Arc<dyn Store>, fast_policy());
        store.set("k", "v").await.unwrap();
        assert_eq!(calls(&flaky), 3);
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let flaky = Arc::new(FlakyStore::new(10));
        let store = ReliableStore::new(flaky.clone() as Arc<dyn Store>, fast_policy());
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wrong_type_is_not_retried() {
        let flaky = Arc::new(FlakyStore::new(0));
        flaky.inner.set("k", "v").await.unwrap();
        let store = ReliableStore::new(flaky.clone() as Arc<dyn Store>, fast_policy());
        let err = store.sadd("k", "m").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default().normalized();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(2));
    }
}
