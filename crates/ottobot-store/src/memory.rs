//! In-process [`Store`] backend.
//!
//! Implements the full adapter contract with real TTL semantics: expired
//! entries are dropped lazily on access and swept during `keys` scans, so a
//! record whose TTL elapses takes effect exactly as it would against an
//! external store. Pub/sub channels are per-channel sender registries;
//! subscribers that went away are reclaimed on the next publish.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Store, StoreError, StoreResult, Subscription};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl State {
    /// Drop the entry if its TTL elapsed, then hand back a live reference.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock means a panic mid-mutation; the store contents are
        // still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn as_str<'a>(entry: &'a mut Entry, key: &str) -> StoreResult<&'a mut String> {
    match &mut entry.value {
        Value::Str(s) => Ok(s),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

/// Normalize a Redis-style inclusive index pair against a list of `len`
/// elements. Returns `None` when the range selects nothing.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Glob match where `*` matches any run of characters.
fn glob_match(pattern: &str, input: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == input;
    }
    let mut rest = input;
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if idx == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with '*' (last part empty) or everything consumed.
    parts.last().is_some_and(|p| p.is_empty()) || rest.is_empty()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => Ok(Some(as_str(entry, key)?.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut state = self.lock();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn setnx(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        let existed = state.live(key).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => {
                let slot = as_str(entry, key)?;
                let current: i64 = slot
                    .parse()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?;
                let next = current + 1;
                *slot = next.to_string();
                Ok(next)
            }
            None => {
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut state = self.lock();
        let now = Instant::now();
        Ok(state
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => Ok(set.insert(member.to_string())),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => {
                let mut set = BTreeSet::new();
                set.insert(member.to_string());
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(set),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &mut entry.value {
                Value::Set(set) => Ok(set.remove(member)),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<usize> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.len()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &mut entry.value {
                Value::List(list) => {
                    list.push(value.to_string());
                    Ok(list.len())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => {
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(vec![value.to_string()]),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &entry.value {
                Value::List(list) => Ok(normalize_range(list.len(), start, stop)
                    .map(|(lo, hi)| list[lo..=hi].to_vec())
                    .unwrap_or_default()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut state = self.lock();
        match state.live(key) {
            Some(entry) => match &mut entry.value {
                Value::List(list) => {
                    *list = normalize_range(list.len(), start, stop)
                        .map(|(lo, hi)| list[lo..=hi].to_vec())
                        .unwrap_or_default();
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(()),
        }
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut state = self.lock();
        let now = Instant::now();
        state.entries.retain(|_, entry| !entry.expired(now));
        let mut matched: Vec<String> = state
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize> {
        let mut state = self.lock();
        let Some(senders) = state.channels.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|tx| tx.send(payload.to_vec()).is_ok());
        let reached = senders.len();
        if senders.is_empty() {
            state.channels.remove(channel);
        }
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(channel.to_string(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn setnx_claims_exactly_once() {
        let store = MemoryStore::new();
        assert!(store.setnx("port:desktop:6080", "s1").await.unwrap());
        assert!(!store.setnx("port:desktop:6080", "s2").await.unwrap());
        assert_eq!(
            store.get("port:desktop:6080").await.unwrap(),
            Some("s1".to_string())
        );
        store.del("port:desktop:6080").await.unwrap();
        assert!(store.setnx("port:desktop:6080", "s2").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expiry_removes_key() {
        let store = MemoryStore::new();
        store
            .setex("session:abc", "{}", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.ttl("session:abc").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("session:abc").await.unwrap(), None);
        assert_eq!(store.ttl("session:abc").await.unwrap(), None);
        // An expired key is claimable again.
        assert!(store.setnx("session:abc", "x").await.unwrap());
    }

    #[tokio::test]
    async fn expire_rearms_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        let remaining = store.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(58));
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("metrics:total_sessions").await.unwrap(), 1);
        assert_eq!(store.incr("metrics:total_sessions").await.unwrap(), 2);
        assert_eq!(store.incr("metrics:total_sessions").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn set_operations() {
        let store = MemoryStore::new();
        assert!(store.sadd("sessions:index", "a").await.unwrap());
        assert!(!store.sadd("sessions:index", "a").await.unwrap());
        store.sadd("sessions:index", "b").await.unwrap();
        assert_eq!(store.scard("sessions:index").await.unwrap(), 2);
        assert!(store.srem("sessions:index", "a").await.unwrap());
        assert!(!store.srem("sessions:index", "a").await.unwrap());
        assert_eq!(store.smembers("sessions:index").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn list_range_and_trim() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.rpush("l", &i.to_string()).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, -1).await.unwrap().len(), 5);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["3", "4"]);
        assert_eq!(store.lrange("l", 3, 99).await.unwrap(), vec!["3", "4"]);
        assert!(store.lrange("l", 9, 12).await.unwrap().is_empty());
        store.ltrim("l", -3, -1).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert!(matches!(
            store.sadd("k", "m").await,
            Err(StoreError::WrongType(_))
        ));
        store.sadd("s", "m").await.unwrap();
        assert!(matches!(store.get("s").await, Err(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn keys_glob_matching() {
        let store = MemoryStore::new();
        store.set("port:desktop:6080", "a").await.unwrap();
        store.set("port:desktop:6081", "b").await.unwrap();
        store.set("port:tool:8080", "c").await.unwrap();
        store.set("session:abc", "d").await.unwrap();
        assert_eq!(store.keys("port:desktop:*").await.unwrap().len(), 2);
        assert_eq!(store.keys("port:*").await.unwrap().len(), 3);
        assert_eq!(
            store.keys("session:abc").await.unwrap(),
            vec!["session:abc"]
        );
        assert_eq!(store.keys("*:abc").await.unwrap(), vec!["session:abc"]);
        assert!(store.keys("worker:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_sweeps_expired_entries() {
        let store = MemoryStore::new();
        store
            .setex("port:tool:8080", "s", Duration::from_millis(20))
            .await
            .unwrap();
        store.set("port:tool:8081", "s2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.keys("port:tool:*").await.unwrap(),
            vec!["port:tool:8081"]
        );
    }

    #[tokio::test]
    async fn pubsub_reaches_every_subscriber() {
        let store = MemoryStore::new();
        let mut sub_a = store.subscribe("ch").await.unwrap();
        let mut sub_b = store.subscribe("ch").await.unwrap();
        let reached = store.publish("ch", b"payload").await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(sub_a.recv().await.unwrap(), b"payload");
        assert_eq!(sub_b.recv().await.unwrap(), b"payload");
        assert_eq!(store.publish("other", b"x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_reclaimed() {
        let store = MemoryStore::new();
        let sub = store.subscribe("ch").await.unwrap();
        drop(sub);
        let mut live = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", b"m").await.unwrap(), 1);
        assert_eq!(live.recv().await.unwrap(), b"m");
    }

    #[test]
    fn glob_edge_cases() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
        assert!(glob_match("worker:*:status", "worker:w1:status"));
        assert!(!glob_match("worker:*:status", "worker:w1:jobs"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact2"));
    }
}
