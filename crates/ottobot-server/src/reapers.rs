//! Background reconciliation tasks.
//!
//! Crash tolerance in the plane is TTLs plus reapers: explicit release is
//! the fast path, the lease TTL is the correctness backstop, and these
//! tasks close the window in between. One frontend runs them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ottobot_sandbox::Supervisor;
use ottobot_session::{PortAllocator, SessionRegistry};

/// Cadence of the orphaned-port sweep.
pub const RECLAIM_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the stale-sandbox sweep.
pub const SANDBOX_REAP_INTERVAL: Duration = Duration::from_secs(600);
/// Containers older than this are presumed leaked.
pub const SANDBOX_STALE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

pub fn spawn_port_reaper(
    registry: SessionRegistry,
    allocator: PortAllocator,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match allocator.reap(&registry).await {
                Ok(0) => {}
                Ok(freed) => {
                    tracing::info!(kind = allocator.kind().label(), freed, "port reaper freed orphans");
                }
                Err(error) => {
                    tracing::warn!(kind = allocator.kind().label(), %error, "port reaper sweep failed");
                }
            }
        }
    })
}

pub fn spawn_sandbox_reaper(
    supervisor: Arc<dyn Supervisor>,
    interval: Duration,
    stale_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match supervisor.reap_stale(stale_age).await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!(removed, "sandbox reaper removed stale containers");
                }
                Err(error) => {
                    tracing::warn!(%error, "sandbox reaper sweep failed");
                }
            }
        }
    })
}
