//! Exclusive TCP port allocation over the coordination store.
//!
//! One allocator instance per range (desktop, tool). A port is claimed with
//! `setnx` under `port:<kind>:<p>` holding the owning session id, and armed
//! with a safety lease so a crashed process can never leak it forever. The
//! scan is linear from the bottom of the range: allocation order is
//! deterministic, and a race loser simply advances to the next port.

use std::sync::Arc;
use std::time::Duration;

use ottobot_store::Store;

use crate::error::{SessionError, SessionResult};
use crate::models::SessionStatus;
use crate::registry::SessionRegistry;

/// Safety lease on a claimed port; the reaper usually frees ports much
/// earlier, this is the backstop when no reaper runs.
pub const PORT_LEASE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    Desktop,
    Tool,
}

impl PortKind {
    pub fn label(self) -> &'static str {
        match self {
            PortKind::Desktop => "desktop",
            PortKind::Tool => "tool",
        }
    }

    fn key(self, port: u16) -> String {
        format!("port:{}:{}", self.label(), port)
    }

    fn pattern(self) -> String {
        format!("port:{}:*", self.label())
    }
}

/// Inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn Store>,
    kind: PortKind,
    range: PortRange,
    lease: Duration,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn Store>, kind: PortKind, range: PortRange) -> Self {
        Self {
            store,
            kind,
            range,
            lease: PORT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Claim the lowest free port in the range for `session_id`. Returns
    /// `None` when every port is held.
    pub async fn allocate(&self, session_id: &str) -> SessionResult<Option<u16>> {
        for port in self.range.start..=self.range.end {
            let key = self.kind.key(port);
            if self.store.setnx(&key, session_id).await? {
                self.store.expire(&key, self.lease).await?;
                tracing::debug!(
                    kind = self.kind.label(),
                    port,
                    session_id,
                    "allocated port"
                );
                return Ok(Some(port));
            }
        }
        tracing::warn!(
            kind = self.kind.label(),
            start = self.range.start,
            end = self.range.end,
            "port range exhausted"
        );
        Ok(None)
    }

    /// Release a claimed port. Idempotent; releasing a free port is a no-op.
    pub async fn release(&self, port: u16) -> SessionResult<()> {
        self.store.del(&self.kind.key(port)).await?;
        Ok(())
    }

    /// Owning session id for a claimed port, if any.
    pub async fn owner(&self, port: u16) -> SessionResult<Option<String>> {
        Ok(self.store.get(&self.kind.key(port)).await?)
    }

    /// Free every port whose owning session is gone or terminated. Ports
    /// whose lease TTL elapsed have already vanished from the store. Returns
    /// the number of ports freed.
    pub async fn reap(&self, registry: &SessionRegistry) -> SessionResult<usize> {
        let mut freed = 0;
        for key in self.store.keys(&self.kind.pattern()).await? {
            let Some(owner) = self.store.get(&key).await? else {
                continue;
            };
            let stale = match registry.get(&owner).await? {
                None => true,
                Some(session) => session.status == SessionStatus::Terminated,
            };
            if stale && self.store.del(&key).await? {
                tracing::info!(key, session_id = owner, "reaped orphaned port");
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Map exhaustion into the error the gateway surfaces as 503.
    pub fn exhausted(&self) -> SessionError {
        SessionError::PortsExhausted(self.kind.label())
    }
}
