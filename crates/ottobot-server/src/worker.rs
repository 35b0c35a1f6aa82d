//! Worker runtime: claims lifecycle jobs and owns the sandboxes it starts.
//!
//! Presence is a TTL-bounded store key refreshed by a heartbeat; if the
//! process dies the key lapses and the fleet treats its sessions as
//! recoverable. Shutdown is cooperative: a cancelled runtime stops claiming,
//! lets in-flight handlers finish up to a bounded timeout, then shuts every
//! local agent down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ottobot_session::{
    SessionResult, WorkQueue, WorkerEntry, WorkerStatus,
};
use ottobot_store::Store;

use crate::lifecycle::Lifecycle;

fn worker_status_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:status")
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// TTL on the presence key; expiry means the worker is presumed dead.
    pub registration_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Idle delay between empty queue polls.
    pub poll_interval: Duration,
    /// Cadence of the stalled-job sweep.
    pub stall_sweep_interval: Duration,
    /// How long in-flight jobs get to finish on shutdown.
    pub drain_timeout: Duration,
    /// Concurrent job handlers.
    pub concurrency: usize,
    /// Soft cap on sessions hosted here; create jobs beyond it are yielded
    /// back for another worker.
    pub max_sessions: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            registration_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            stall_sweep_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            concurrency: 2,
            max_sessions: 10,
        }
    }
}

pub fn new_worker_id() -> String {
    let id = Uuid::new_v4();
    let mut buffer = Uuid::encode_buffer();
    let encoded = id.as_simple().encode_lower(&mut buffer);
    format!("worker-{}", &encoded[..8])
}

pub struct WorkerRuntime {
    id: String,
    store: Arc<dyn Store>,
    queue: WorkQueue,
    lifecycle: Arc<Lifecycle>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl WorkerRuntime {
    pub fn new(
        id: String,
        store: Arc<dyn Store>,
        queue: WorkQueue,
        lifecycle: Arc<Lifecycle>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            store,
            queue,
            lifecycle,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops the runtime when cancelled (signal handler, tests).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Registers presence, heartbeats, sweeps stalls
    /// and claims jobs on `concurrency` loops; on cancellation drains and
    /// deregisters.
    pub async fn run(&self) -> SessionResult<()> {
        self.register(WorkerStatus::Active).await?;
        tracing::info!(worker_id = %self.id, concurrency = self.config.concurrency, "worker started");

        let heartbeat = {
            let store = self.store.clone();
            let id = self.id.clone();
            let interval = self.config.heartbeat_interval;
            let ttl = self.config.registration_ttl;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let entry = WorkerEntry {
                        id: id.clone(),
                        status: WorkerStatus::Active,
                        last_heartbeat: Utc::now(),
                    };
                    let raw = match serde_json::to_string(&entry) {
                        Ok(raw) => raw,
                        Err(_) => continue,
                    };
                    if let Err(error) = store.setex(&worker_status_key(&id), &raw, ttl).await {
                        tracing::warn!(worker_id = %id, %error, "heartbeat failed");
                    }
                }
            })
        };

        let stall_sweeper = {
            let queue = self.queue.clone();
            let interval = self.config.stall_sweep_interval;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match queue.reap_stalled().await {
                        Ok(0) => {}
                        Ok(requeued) => {
                            tracing::warn!(requeued, "stalled jobs swept");
                        }
                        Err(error) => {
                            tracing::warn!(%error, "stall sweep failed");
                        }
                    }
                }
            })
        };

        let mut loops = JoinSet::new();
        for slot in 0..self.config.concurrency.max(1) {
            let queue = self.queue.clone();
            let lifecycle = self.lifecycle.clone();
            let id = self.id.clone();
            let poll_interval = self.config.poll_interval;
            let lease_interval = self.queue.config().stalled_interval / 3;
            let max_sessions = self.config.max_sessions;
            let cancel = self.cancel.clone();
            loops.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match queue.claim(&id).await {
                        Ok(Some(mut job)) => {
                            // Soft capacity cap: a create for a session not
                            // already hosted here goes back for another
                            // worker.
                            if job.kind == ottobot_session::JobKind::CreateSession
                                && !lifecycle.has_agent(&job.session_id)
                                && lifecycle.active_agents() >= max_sessions
                            {
                                if let Err(error) =
                                    queue.requeue(&mut job, poll_interval * 4).await
                                {
                                    tracing::warn!(
                                        worker_id = %id,
                                        job_id = %job.id,
                                        %error,
                                        "capacity yield failed"
                                    );
                                }
                                continue;
                            }
                            let renewer = {
                                let queue = queue.clone();
                                let job = job.clone();
                                tokio::spawn(async move {
                                    loop {
                                        tokio::time::sleep(lease_interval).await;
                                        if queue.renew_lease(&job).await.is_err() {
                                            break;
                                        }
                                    }
                                })
                            };
                            let outcome = lifecycle.handle(&mut job).await;
                            renewer.abort();
                            let finish = match outcome {
                                Ok(()) => queue.complete(&job).await,
                                Err(error) => queue.fail(&mut job, &error.to_string()).await,
                            };
                            if let Err(error) = finish {
                                tracing::error!(
                                    worker_id = %id,
                                    slot,
                                    job_id = %job.id,
                                    %error,
                                    "failed to settle job"
                                );
                            }
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                        Err(error) => {
                            tracing::warn!(worker_id = %id, slot, %error, "claim failed");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                    }
                }
            });
        }

        self.cancel.cancelled().await;
        tracing::info!(worker_id = %self.id, "worker stopping; draining in-flight jobs");
        self.register(WorkerStatus::Stopping).await.ok();

        let drain = async {
            while loops.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!(worker_id = %self.id, "drain timed out; aborting remaining handlers");
            loops.abort_all();
        }

        self.lifecycle.shutdown_all_agents().await;
        heartbeat.abort();
        stall_sweeper.abort();
        self.store.del(&worker_status_key(&self.id)).await?;
        tracing::info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    async fn register(&self, status: WorkerStatus) -> SessionResult<()> {
        let entry = WorkerEntry {
            id: self.id.clone(),
            status,
            last_heartbeat: Utc::now(),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| ottobot_session::SessionError::corrupt(worker_status_key(&self.id), e))?;
        self.store
            .setex(
                &worker_status_key(&self.id),
                &raw,
                self.config.registration_ttl,
            )
            .await?;
        Ok(())
    }
}
