//! Durable job queue over the coordination store.
//!
//! Delivery is at-least-once: handlers are expected to be idempotent.
//! Pending and active membership are store sets; `srem` on the pending set
//! is the atomic claim, so exactly one worker wins a job even when several
//! pollers see it simultaneously. A claimed job holds a lease key with a
//! short TTL which the worker renews while the handler runs; a job whose
//! lease lapsed is re-queued by the stall reaper, and after `max_stalled`
//! lapses it lands in the dead-letter set.
//!
//! Priority convention: LOWER numeric value is served first (create and
//! process are 1, terminate is 2). Terminate therefore yields to fresh
//! work by default, but can never starve: any job that has waited longer
//! than `aging_threshold` is served before every younger job regardless of
//! priority.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use ottobot_store::Store;

use crate::error::{SessionError, SessionResult};
use crate::models::{Job, JobKind};

const PENDING_KEY: &str = "queue:pending";
const ACTIVE_KEY: &str = "queue:active";
const FAILED_KEY: &str = "queue:failed";
const DEAD_KEY: &str = "queue:dead";

fn job_key(id: &str) -> String {
    format!("queue:job:{id}")
}

fn lease_key(id: &str) -> String {
    format!("queue:lease:{id}")
}

fn worker_jobs_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:jobs")
}

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Claims before a failing job is parked in the failed set.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff: Duration,
    /// Cap on the retry delay.
    pub retry_backoff_max: Duration,
    /// Lease TTL; a job unleased longer than this counts as stalled.
    pub stalled_interval: Duration,
    /// Lease lapses before the job is dead-lettered.
    pub max_stalled: u32,
    /// Wait time after which a job outranks every younger job.
    pub aging_threshold: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(60),
            stalled_interval: Duration::from_secs(30),
            max_stalled: 3,
            aging_threshold: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn Store>,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub async fn enqueue(
        &self,
        kind: JobKind,
        session_id: &str,
        payload: serde_json::Value,
    ) -> SessionResult<Job> {
        let job = Job::new(kind, session_id, payload);
        self.persist(&job).await?;
        self.store.sadd(PENDING_KEY, &job.id).await?;
        tracing::info!(job_id = %job.id, kind = %kind, session_id, "job enqueued");
        Ok(job)
    }

    /// Claim the most urgent runnable job for `worker_id`, or `None` when
    /// nothing is runnable. The claim is atomic: of all pollers that saw the
    /// same job, only the one whose `srem` succeeded owns it.
    pub async fn claim(&self, worker_id: &str) -> SessionResult<Option<Job>> {
        let now = Utc::now();
        let mut candidates = Vec::new();
        for id in self.store.smembers(PENDING_KEY).await? {
            match self.get(&id).await? {
                Some(job) => {
                    if job.run_at <= now {
                        candidates.push(job);
                    }
                }
                None => {
                    // Job record gone (e.g. session purge); drop the id.
                    self.store.srem(PENDING_KEY, &id).await?;
                }
            }
        }

        let aging = ChronoDuration::from_std(self.config.aging_threshold)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        candidates.sort_by_key(|job| {
            let aged = now - job.created_at > aging;
            let effective_priority = if aged { 0 } else { job.priority };
            (effective_priority, job.created_at, job.id.clone())
        });

        for mut job in candidates {
            if !self.store.srem(PENDING_KEY, &job.id).await? {
                continue; // lost the race, try the next one
            }
            job.attempts += 1;
            job.worker_id = Some(worker_id.to_string());
            self.persist(&job).await?;
            self.store
                .setex(&lease_key(&job.id), worker_id, self.config.stalled_interval)
                .await?;
            self.store.sadd(ACTIVE_KEY, &job.id).await?;
            self.store.sadd(&worker_jobs_key(worker_id), &job.id).await?;
            tracing::debug!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                worker_id,
                "job claimed"
            );
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Keep the lease alive while a handler runs.
    pub async fn renew_lease(&self, job: &Job) -> SessionResult<()> {
        if let Some(worker_id) = &job.worker_id {
            self.store
                .setex(&lease_key(&job.id), worker_id, self.config.stalled_interval)
                .await?;
        }
        Ok(())
    }

    /// Record handler progress on the durable job record.
    pub async fn update_progress(&self, job: &mut Job, progress: u8) -> SessionResult<()> {
        job.progress = progress.min(100);
        self.persist(job).await
    }

    /// Successful completion: the job record is garbage-collected.
    pub async fn complete(&self, job: &Job) -> SessionResult<()> {
        self.release(job).await?;
        self.store.del(&job_key(&job.id)).await?;
        tracing::debug!(job_id = %job.id, kind = %job.kind, "job completed");
        Ok(())
    }

    /// Failed attempt: re-queue with exponential backoff while attempts
    /// remain, otherwise park in the failed set for inspection.
    pub async fn fail(&self, job: &mut Job, error: &str) -> SessionResult<()> {
        self.release(job).await?;
        job.error = Some(error.to_string());
        if job.attempts < self.config.max_attempts {
            let delay = self.backoff_for_attempt(job.attempts);
            job.run_at = Utc::now()
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(2));
            self.persist(job).await?;
            self.store.sadd(PENDING_KEY, &job.id).await?;
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "job failed; scheduled for retry"
            );
        } else {
            self.persist(job).await?;
            self.store.sadd(FAILED_KEY, &job.id).await?;
            tracing::error!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = job.attempts,
                error,
                "job failed permanently"
            );
        }
        Ok(())
    }

    /// Hand a claimed job back without consuming an attempt: a capacity
    /// yield, not a failure. The delay keeps the same worker from
    /// immediately re-claiming it.
    pub async fn requeue(&self, job: &mut Job, delay: Duration) -> SessionResult<()> {
        self.release(job).await?;
        job.attempts = job.attempts.saturating_sub(1);
        job.worker_id = None;
        job.run_at = Utc::now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(1));
        self.persist(job).await?;
        self.store.sadd(PENDING_KEY, &job.id).await?;
        tracing::debug!(job_id = %job.id, kind = %job.kind, "job yielded back to the queue");
        Ok(())
    }

    /// Re-queue active jobs whose lease lapsed; dead-letter a job once it
    /// has stalled too often. Returns the number of jobs touched.
    pub async fn reap_stalled(&self) -> SessionResult<usize> {
        let mut touched = 0;
        for id in self.store.smembers(ACTIVE_KEY).await? {
            if self.store.get(&lease_key(&id)).await?.is_some() {
                continue;
            }
            let Some(mut job) = self.get(&id).await? else {
                self.store.srem(ACTIVE_KEY, &id).await?;
                continue;
            };
            self.release(&job).await?;
            job.stalls += 1;
            if job.stalls > self.config.max_stalled {
                self.persist(&job).await?;
                self.store.sadd(DEAD_KEY, &id).await?;
                tracing::error!(job_id = %id, kind = %job.kind, stalls = job.stalls, "job dead-lettered");
            } else {
                job.run_at = Utc::now();
                job.worker_id = None;
                self.persist(&job).await?;
                self.store.sadd(PENDING_KEY, &id).await?;
                tracing::warn!(job_id = %id, kind = %job.kind, stalls = job.stalls, "stalled job re-queued");
            }
            touched += 1;
        }
        Ok(touched)
    }

    pub async fn get(&self, id: &str) -> SessionResult<Option<Job>> {
        let key = job_key(id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|e| SessionError::corrupt(&key, e))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn pending_len(&self) -> SessionResult<usize> {
        Ok(self.store.scard(PENDING_KEY).await?)
    }

    pub async fn active_len(&self) -> SessionResult<usize> {
        Ok(self.store.scard(ACTIVE_KEY).await?)
    }

    pub async fn failed_len(&self) -> SessionResult<usize> {
        Ok(self.store.scard(FAILED_KEY).await?)
    }

    pub async fn dead_len(&self) -> SessionResult<usize> {
        Ok(self.store.scard(DEAD_KEY).await?)
    }

    pub async fn jobs_for_worker(&self, worker_id: &str) -> SessionResult<Vec<String>> {
        Ok(self.store.smembers(&worker_jobs_key(worker_id)).await?)
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let base_ms = self.config.retry_backoff.as_millis() as u64;
        let delay = base_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(delay).min(self.config.retry_backoff_max)
    }

    async fn release(&self, job: &Job) -> SessionResult<()> {
        self.store.srem(ACTIVE_KEY, &job.id).await?;
        self.store.del(&lease_key(&job.id)).await?;
        if let Some(worker_id) = &job.worker_id {
            self.store
                .srem(&worker_jobs_key(worker_id), &job.id)
                .await?;
        }
        Ok(())
    }

    async fn persist(&self, job: &Job) -> SessionResult<()> {
        let key = job_key(&job.id);
        let raw = serde_json::to_string(job).map_err(|e| SessionError::corrupt(&key, e))?;
        self.store.set(&key, &raw).await?;
        Ok(())
    }
}
