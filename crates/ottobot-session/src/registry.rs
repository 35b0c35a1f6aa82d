//! Durable session records and their derived streams.
//!
//! Everything about a session that must survive a process crash lives here:
//! the record itself (TTL-bounded), the index sets, the append-only message
//! stream, the capped log stream and the opaque agent context blob. Stream
//! TTLs are re-synchronized to the record's residual TTL on every append, so
//! when the record expires the derived keys go with it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use ottobot_store::Store;

use crate::error::{SessionError, SessionResult};
use crate::models::{
    new_session_id, Environment, LogLevel, MessageEvent, Session, SessionLogEntry, SessionPatch,
    SessionStatus,
};

/// Cap on the per-session log stream.
pub const MAX_LOG_ENTRIES: usize = 1000;

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn messages_key(id: &str) -> String {
    format!("session:messages:{id}")
}

fn logs_key(id: &str) -> String {
    format!("session:logs:{id}")
}

fn context_key(id: &str) -> String {
    format!("session:context:{id}")
}

fn worker_sessions_key(worker_id: &str) -> String {
    format!("sessions:by-worker:{worker_id}")
}

const INDEX_KEY: &str = "sessions:index";
const TOTAL_SESSIONS_KEY: &str = "metrics:total_sessions";

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    default_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Create a fresh session record with `status = Initializing`, register
    /// it in the index and bump the monotonic counter.
    pub async fn create(
        &self,
        initial_prompt: &str,
        timeout: Option<Duration>,
        environment: Environment,
    ) -> SessionResult<Session> {
        let ttl = timeout.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let session = Session {
            id: new_session_id(),
            status: SessionStatus::Initializing,
            initial_prompt: initial_prompt.to_string(),
            environment,
            created_at: now,
            updated_at: now,
            expires_at: now
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
            desktop_port: None,
            tool_port: None,
            sandbox_id: None,
            worker_id: None,
            error: None,
        };
        self.write(&session, ttl).await?;
        self.store.sadd(INDEX_KEY, &session.id).await?;
        self.store.incr(TOTAL_SESSIONS_KEY).await?;
        tracing::info!(session_id = %session.id, environment = environment.as_str(), "session created");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> SessionResult<Option<Session>> {
        let key = session_key(id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|e| SessionError::corrupt(&key, e))?,
            )),
            None => Ok(None),
        }
    }

    /// Apply a partial update, preserving the record's residual TTL. Setting
    /// a new `worker_id` moves the session between worker index sets.
    pub async fn update(&self, id: &str, patch: SessionPatch) -> SessionResult<Option<Session>> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(None);
        };
        let residual = self.residual_ttl(id).await?;

        if let Some(worker_id) = &patch.worker_id {
            if session.worker_id.as_deref() != Some(worker_id) {
                if let Some(previous) = &session.worker_id {
                    self.store
                        .srem(&worker_sessions_key(previous), id)
                        .await?;
                }
                self.store.sadd(&worker_sessions_key(worker_id), id).await?;
            }
            session.worker_id = Some(worker_id.clone());
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(port) = patch.desktop_port {
            session.desktop_port = Some(port);
        }
        if let Some(port) = patch.tool_port {
            session.tool_port = Some(port);
        }
        if let Some(sandbox_id) = patch.sandbox_id {
            session.sandbox_id = Some(sandbox_id);
        }
        if let Some(error) = patch.error {
            session.error = Some(error);
        }
        session.updated_at = Utc::now();

        self.write(&session, residual).await?;
        Ok(Some(session))
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<String>,
    ) -> SessionResult<Option<Session>> {
        self.update(
            id,
            SessionPatch {
                status: Some(status),
                error,
                ..Default::default()
            },
        )
        .await
    }

    /// Remove the record and every derived key. Returns whether the record
    /// existed.
    pub async fn delete(&self, id: &str) -> SessionResult<bool> {
        if let Some(session) = self.get(id).await? {
            if let Some(worker_id) = &session.worker_id {
                self.store.srem(&worker_sessions_key(worker_id), id).await?;
            }
        }
        let existed = self.store.del(&session_key(id)).await?;
        self.store.del(&messages_key(id)).await?;
        self.store.del(&logs_key(id)).await?;
        self.store.del(&context_key(id)).await?;
        self.store.srem(INDEX_KEY, id).await?;
        if existed {
            tracing::info!(session_id = id, "session purged");
        }
        Ok(existed)
    }

    pub async fn append_message(&self, id: &str, event: &MessageEvent) -> SessionResult<()> {
        let raw = serde_json::to_string(event)
            .map_err(|e| SessionError::corrupt(messages_key(id), e))?;
        self.store.rpush(&messages_key(id), &raw).await?;
        self.resync_stream_ttl(id, &messages_key(id)).await
    }

    /// Last `n` stored events, oldest first. `None` returns the full stream.
    pub async fn read_messages(
        &self,
        id: &str,
        last_n: Option<usize>,
    ) -> SessionResult<Vec<MessageEvent>> {
        let key = messages_key(id);
        let start = match last_n {
            Some(n) => -(n as i64),
            None => 0,
        };
        let raw = self.store.lrange(&key, start, -1).await?;
        raw.iter()
            .map(|item| serde_json::from_str(item).map_err(|e| SessionError::corrupt(&key, e)))
            .collect()
    }

    pub async fn append_log(
        &self,
        id: &str,
        level: LogLevel,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> SessionResult<()> {
        let entry = SessionLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            metadata,
        };
        let key = logs_key(id);
        let raw = serde_json::to_string(&entry).map_err(|e| SessionError::corrupt(&key, e))?;
        self.store.rpush(&key, &raw).await?;
        self.store
            .ltrim(&key, -(MAX_LOG_ENTRIES as i64), -1)
            .await?;
        self.resync_stream_ttl(id, &key).await
    }

    pub async fn read_logs(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> SessionResult<Vec<SessionLogEntry>> {
        let key = logs_key(id);
        let start = match limit {
            Some(n) => -(n as i64),
            None => 0,
        };
        let raw = self.store.lrange(&key, start, -1).await?;
        raw.iter()
            .map(|item| serde_json::from_str(item).map_err(|e| SessionError::corrupt(&key, e)))
            .collect()
    }

    /// Opaque agent context blob, TTL aligned to the record.
    pub async fn set_context(&self, id: &str, context: &str) -> SessionResult<()> {
        let ttl = self.residual_ttl(id).await?;
        self.store.setex(&context_key(id), context, ttl).await?;
        Ok(())
    }

    pub async fn get_context(&self, id: &str) -> SessionResult<Option<String>> {
        Ok(self.store.get(&context_key(id)).await?)
    }

    /// Live (non-Terminated) sessions sorted by `created_at` descending.
    /// Index entries whose record expired are pruned on the way through.
    pub async fn list_active(
        &self,
        limit: usize,
        offset: usize,
    ) -> SessionResult<Vec<Session>> {
        let mut sessions = self.collect_active().await?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn count_active(&self) -> SessionResult<usize> {
        Ok(self.collect_active().await?.len())
    }

    pub async fn total_sessions(&self) -> SessionResult<i64> {
        match self.store.get(TOTAL_SESSIONS_KEY).await? {
            Some(raw) => raw
                .parse()
                .map_err(|e| SessionError::corrupt(TOTAL_SESSIONS_KEY, e)),
            None => Ok(0),
        }
    }

    /// Session ids currently pinned to a worker.
    pub async fn sessions_for_worker(&self, worker_id: &str) -> SessionResult<Vec<String>> {
        Ok(self.store.smembers(&worker_sessions_key(worker_id)).await?)
    }

    async fn collect_active(&self) -> SessionResult<Vec<Session>> {
        let ids = self.store.smembers(INDEX_KEY).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await? {
                Some(session) if session.status != SessionStatus::Terminated => {
                    sessions.push(session);
                }
                Some(_) => {}
                None => {
                    // Record expired; drop the dangling index entry.
                    self.store.srem(INDEX_KEY, &id).await?;
                }
            }
        }
        Ok(sessions)
    }

    async fn residual_ttl(&self, id: &str) -> SessionResult<Duration> {
        Ok(self
            .store
            .ttl(&session_key(id))
            .await?
            .unwrap_or(self.default_ttl))
    }

    async fn write(&self, session: &Session, ttl: Duration) -> SessionResult<()> {
        let key = session_key(&session.id);
        let raw = serde_json::to_string(session).map_err(|e| SessionError::corrupt(&key, e))?;
        self.store.setex(&key, &raw, ttl).await?;
        Ok(())
    }

    async fn resync_stream_ttl(&self, id: &str, stream_key: &str) -> SessionResult<()> {
        if let Some(residual) = self.store.ttl(&session_key(id)).await? {
            self.store.expire(stream_key, residual).await?;
        }
        Ok(())
    }
}
