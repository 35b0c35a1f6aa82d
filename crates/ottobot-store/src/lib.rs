//! Coordination store adapter.
//!
//! Every cross-process concern in the plane (session records, port claims,
//! the work queue, chat fan-out) goes through the [`Store`] trait: a small
//! KV + set + list surface with TTLs, an atomic create-if-absent, and
//! pub/sub channels. All mutating operations are individually atomic; no
//! multi-key transactions are assumed anywhere above this layer.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod retry;

pub use memory::MemoryStore;
pub use retry::{ReliableStore, RetryPolicy};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure talking to the backing store. Retriable.
    #[error("store transport failure: {0}")]
    Transport(String),
    /// The key exists but holds a different value shape than the operation
    /// expects (e.g. `sadd` on a plain string key).
    #[error("wrong value type for key '{0}'")]
    WrongType(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A live pub/sub subscription. Messages published to the channel after the
/// subscription was created arrive on [`Subscription::recv`]. Dropping the
/// subscription detaches it; the backend reclaims the channel slot on its
/// next publish.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(channel: String, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { channel, rx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next published payload, or `None` once the backend has
    /// dropped the channel.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Set with an absolute TTL. Overwrites any previous value and TTL.
    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    /// Atomic create-if-absent. Returns `true` for exactly one caller per
    /// live key; the value and any TTL of an existing key are untouched.
    async fn setnx(&self, key: &str, value: &str) -> StoreResult<bool>;
    /// Delete a key of any shape. Returns whether it existed. Idempotent.
    async fn del(&self, key: &str) -> StoreResult<bool>;
    /// Increment an integer value, creating it at 0 first. Returns the new
    /// value. Preserves any TTL on the key.
    async fn incr(&self, key: &str) -> StoreResult<i64>;
    /// Remaining TTL, or `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;
    /// (Re)arm the TTL on an existing key. Returns `false` if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn scard(&self, key: &str) -> StoreResult<usize>;

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize>;
    /// Inclusive range with Redis index semantics: negative indices count
    /// from the tail (`-1` is the last element).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;
    /// Trim the list to the inclusive range, Redis index semantics.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()>;

    /// Glob-match live keys. `*` matches any run of characters. Bounded use
    /// only: reapers and health checks, never request paths.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Publish to a channel. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize>;
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}
