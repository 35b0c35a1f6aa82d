//! Session lifecycle controller.
//!
//! Drives a session through Initializing → Ready → Running → Terminating →
//! Terminated, with Error reachable from any non-terminal state. Handlers
//! run on workers under at-least-once delivery, so every step is idempotent
//! and the session record is re-read after each suspension: a terminate
//! that raced in is observed at the next checkpoint and the create path
//! short-circuits into cleanup instead of finishing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use ottobot_sandbox::{SandboxError, SandboxSpec, SandboxState, Supervisor};
use ottobot_session::{
    EventMetadata, Job, JobKind, LogLevel, MessageEvent, MessageFabric, PortAllocator, Session,
    SessionError, SessionPatch, SessionRegistry, SessionStatus, WorkQueue,
};

use crate::agent::{Agent, AgentError, AgentFactory, EventSink};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("session {0} no longer exists")]
    SessionGone(String),
    #[error("no available {0} port")]
    ResourceExhausted(&'static str),
    #[error("malformed job payload: {0}")]
    BadPayload(String),
    #[error("agent for session {0} is not running and cannot be rehydrated")]
    AgentGone(String),
}

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Hard deadline on the desktop readiness probe.
    pub ready_wait: Duration,
    /// Grace given to the container on stop.
    pub stop_grace: Duration,
    /// Pause between stop and remove so in-container processes can drain.
    pub stop_pause: Duration,
    /// Delay before a Terminated session's keys are purged, so a client
    /// that just disconnected can still fetch logs.
    pub purge_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_wait: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            stop_pause: Duration::from_secs(2),
            purge_delay: Duration::from_secs(300),
        }
    }
}

pub struct Lifecycle {
    worker_id: String,
    registry: SessionRegistry,
    fabric: MessageFabric,
    queue: WorkQueue,
    desktop_ports: PortAllocator,
    tool_ports: PortAllocator,
    supervisor: Arc<dyn Supervisor>,
    factory: Arc<dyn AgentFactory>,
    agents: DashMap<String, Arc<dyn Agent>>,
    /// Host used to build the tool endpoint handed to agents.
    host: String,
    config: LifecycleConfig,
}

impl Lifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        registry: SessionRegistry,
        fabric: MessageFabric,
        queue: WorkQueue,
        desktop_ports: PortAllocator,
        tool_ports: PortAllocator,
        supervisor: Arc<dyn Supervisor>,
        factory: Arc<dyn AgentFactory>,
        host: String,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            worker_id,
            registry,
            fabric,
            queue,
            desktop_ports,
            tool_ports,
            supervisor,
            factory,
            agents: DashMap::new(),
            host,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn active_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn has_agent(&self, session_id: &str) -> bool {
        self.agents.contains_key(session_id)
    }

    /// Dispatch one claimed job. On error the failure path has already run
    /// (session marked, resources cleaned); the caller only has to count
    /// the job as failed.
    pub async fn handle(&self, job: &mut Job) -> Result<(), LifecycleError> {
        let result = match job.kind {
            JobKind::CreateSession => self.handle_create(job).await,
            JobKind::ProcessMessage => self.handle_process(job).await,
            JobKind::TerminateSession => self.handle_terminate(job).await,
        };
        if let Err(error) = &result {
            self.fail_session(&job.session_id, error).await;
        }
        result
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    async fn handle_create(&self, job: &mut Job) -> Result<(), LifecycleError> {
        let sid = job.session_id.clone();
        let mut session = self.load(&sid).await?;

        match session.status {
            SessionStatus::Terminated | SessionStatus::Error => return Ok(()),
            SessionStatus::Terminating => {
                self.abort_create(&session).await;
                return Ok(());
            }
            _ => {}
        }

        // Redelivered after a previous success: re-announce and stop.
        if matches!(session.status, SessionStatus::Ready | SessionStatus::Running)
            && self.agents.contains_key(&sid)
        {
            self.announce_ready(&session).await;
            self.progress(job, 100).await;
            return Ok(());
        }

        self.progress(job, 10).await;
        session = self
            .patch(&sid, SessionPatch {
                worker_id: Some(self.worker_id.clone()),
                ..Default::default()
            })
            .await?;

        let tool_port = match session.tool_port {
            Some(port) => port,
            None => {
                let port = self
                    .tool_ports
                    .allocate(&sid)
                    .await?
                    .ok_or(LifecycleError::ResourceExhausted("tool"))?;
                session = self
                    .patch(&sid, SessionPatch {
                        tool_port: Some(port),
                        ..Default::default()
                    })
                    .await?;
                port
            }
        };
        self.progress(job, 30).await;

        if self.terminate_raced(&sid).await? {
            self.abort_create(&session).await;
            return Ok(());
        }

        let sandbox_id = match session.sandbox_id.clone() {
            Some(id) => id,
            None => {
                let desktop_port = session
                    .desktop_port
                    .ok_or_else(|| LifecycleError::BadPayload("session has no desktop port".into()))?;
                let spec = SandboxSpec {
                    session_id: sid.clone(),
                    environment: session.environment.as_str().to_string(),
                    desktop_port,
                    tool_port,
                };
                let descriptor = self.supervisor.create(&spec).await?;
                session = self
                    .patch(&sid, SessionPatch {
                        sandbox_id: Some(descriptor.sandbox_id.clone()),
                        ..Default::default()
                    })
                    .await?;
                self.log(&sid, LogLevel::Info, "sandbox created", None).await;
                descriptor.sandbox_id
            }
        };
        self.progress(job, 50).await;

        self.supervisor.start(&sandbox_id).await?;
        self.log(&sid, LogLevel::Info, "sandbox started", None).await;
        self.progress(job, 70).await;

        if self.terminate_raced(&sid).await? {
            self.abort_create(&session).await;
            return Ok(());
        }

        let desktop_port = session
            .desktop_port
            .ok_or_else(|| LifecycleError::BadPayload("session has no desktop port".into()))?;
        self.supervisor
            .wait_for_desktop(&sandbox_id, desktop_port, self.config.ready_wait)
            .await?;
        self.progress(job, 90).await;

        if !self.agents.contains_key(&sid) {
            let endpoint = format!("http://{}:{}", self.host, tool_port);
            let sink = EventSink::new(&sid, self.registry.clone(), self.fabric.clone());
            let agent = self.factory.spawn(&sid, &endpoint, sink).await?;
            self.agents.insert(sid.clone(), agent);
        }

        if self.terminate_raced(&sid).await? {
            self.abort_create(&session).await;
            return Ok(());
        }

        let session = self
            .patch(&sid, SessionPatch {
                status: Some(SessionStatus::Ready),
                ..Default::default()
            })
            .await?;
        self.announce_ready(&session).await;
        self.log(&sid, LogLevel::Info, "session ready", None).await;
        self.progress(job, 100).await;
        Ok(())
    }

    async fn announce_ready(&self, session: &Session) {
        let event = MessageEvent::system_update("Session is ready. Desktop is now accessible.")
            .with_metadata(EventMetadata {
                desktop_ready: Some(true),
                session_status: Some(SessionStatus::Ready),
                ..Default::default()
            });
        self.emit(&session.id, event).await;
    }

    /// A terminate arrived while create was in flight: tear down whatever
    /// exists and converge on Terminated.
    async fn abort_create(&self, session: &Session) {
        tracing::info!(session_id = %session.id, "terminate observed mid-create; aborting");
        let session = self
            .load(&session.id)
            .await
            .unwrap_or_else(|_| session.clone());
        self.cleanup(&session).await;
        if let Err(error) = self
            .registry
            .set_status(&session.id, SessionStatus::Terminated, None)
            .await
        {
            tracing::warn!(session_id = %session.id, %error, "failed to mark aborted session");
        }
        self.schedule_purge(&session.id);
    }

    // ------------------------------------------------------------------
    // Process
    // ------------------------------------------------------------------

    async fn handle_process(&self, job: &mut Job) -> Result<(), LifecycleError> {
        let sid = job.session_id.clone();
        let content = job
            .payload
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LifecycleError::BadPayload("process job without content".into()))?
            .to_string();

        let session = self.load(&sid).await?;
        if session.status.is_terminal() || session.status == SessionStatus::Terminating {
            // The session is on its way out; the prompt is dropped.
            return Ok(());
        }

        let agent = match self.agents.get(&sid).map(|entry| entry.value().clone()) {
            Some(agent) => agent,
            None => self.rehydrate(&session).await?,
        };

        if session.status == SessionStatus::Ready {
            self.registry
                .set_status(&sid, SessionStatus::Running, None)
                .await?;
        }

        // The stored copy was appended by the chat socket on receipt; here
        // the prompt only goes out to live subscribers, ahead of any agent
        // output.
        if let Err(error) = self
            .fabric
            .publish(&sid, MessageEvent::user_prompt(&content))
            .await
        {
            tracing::warn!(session_id = %sid, %error, "failed to broadcast user prompt");
        }

        match agent.process(&content).await {
            Ok(()) => Ok(()),
            Err(error) if !error.is_fatal() => {
                // The agent stumbled but the session stays usable.
                tracing::warn!(session_id = %sid, %error, "agent turn failed");
                self.log(&sid, LogLevel::Warning, &error.to_string(), None).await;
                let event = MessageEvent::error("The agent hit an error processing your message.")
                    .with_metadata(EventMetadata {
                        error: Some(error.to_string()),
                        ..Default::default()
                    });
                self.emit(&sid, event).await;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// A process job landed on a worker with no in-memory agent (restart,
    /// requeue). If the container still runs, spawn a fresh agent against
    /// it; otherwise the job fails.
    async fn rehydrate(&self, session: &Session) -> Result<Arc<dyn Agent>, LifecycleError> {
        let (Some(sandbox_id), Some(tool_port)) = (&session.sandbox_id, session.tool_port) else {
            return Err(LifecycleError::AgentGone(session.id.clone()));
        };
        if self.supervisor.status(sandbox_id).await? != SandboxState::Running {
            return Err(LifecycleError::AgentGone(session.id.clone()));
        }
        tracing::info!(session_id = %session.id, "rehydrating agent against live sandbox");
        let endpoint = format!("http://{}:{}", self.host, tool_port);
        let sink = EventSink::new(&session.id, self.registry.clone(), self.fabric.clone());
        let agent = self.factory.spawn(&session.id, &endpoint, sink).await?;
        self.agents.insert(session.id.clone(), agent.clone());
        Ok(agent)
    }

    // ------------------------------------------------------------------
    // Terminate
    // ------------------------------------------------------------------

    async fn handle_terminate(&self, job: &mut Job) -> Result<(), LifecycleError> {
        let sid = job.session_id.clone();
        let Some(session) = self.registry.get(&sid).await? else {
            return Ok(()); // already purged
        };
        if session.status == SessionStatus::Terminated {
            return Ok(()); // replayed after success
        }

        if let Some((_, agent)) = self.agents.remove(&sid) {
            agent.shutdown().await;
        }

        if let Some(sandbox_id) = &session.sandbox_id {
            self.supervisor.stop(sandbox_id, self.config.stop_grace).await?;
            tokio::time::sleep(self.config.stop_pause).await;
            self.supervisor.remove(sandbox_id).await?;
            self.log(&sid, LogLevel::Info, "sandbox removed", None).await;
        }

        if let Some(port) = session.desktop_port {
            self.desktop_ports.release(port).await?;
        }
        if let Some(port) = session.tool_port {
            self.tool_ports.release(port).await?;
        }

        self.registry
            .set_status(&sid, SessionStatus::Terminated, None)
            .await?;
        let event = MessageEvent::system_update("Session terminated").with_metadata(
            EventMetadata {
                session_status: Some(SessionStatus::Terminated),
                ..Default::default()
            },
        );
        self.emit(&sid, event).await;
        self.schedule_purge(&sid);
        Ok(())
    }

    /// Purge all session keys after the grace window so a just-disconnected
    /// client can still fetch logs.
    fn schedule_purge(&self, session_id: &str) {
        let registry = self.registry.clone();
        let sid = session_id.to_string();
        let delay = self.config.purge_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = registry.delete(&sid).await {
                tracing::warn!(session_id = %sid, %error, "delayed purge failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Failure path
    // ------------------------------------------------------------------

    /// Record the failure and run the cleanup superset of terminate. The
    /// record itself is kept (status Error stays observable through the
    /// API) and left to its TTL.
    async fn fail_session(&self, session_id: &str, error: &LifecycleError) {
        tracing::error!(session_id, %error, "lifecycle handler failed");
        let session = match self.registry.get(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(store_error) => {
                tracing::error!(session_id, %store_error, "cannot load session for cleanup");
                return;
            }
        };

        self.cleanup(&session).await;

        // A terminal status is never overwritten.
        if !session.status.is_terminal() {
            if let Err(update_error) = self
                .registry
                .set_status(session_id, SessionStatus::Error, Some(error.to_string()))
                .await
            {
                tracing::error!(session_id, %update_error, "failed to record session error");
            }
        }
        self.log(session_id, LogLevel::Error, &error.to_string(), None)
            .await;
        let event = MessageEvent::error("Session failed").with_metadata(EventMetadata {
            error: Some(error.to_string()),
            session_status: Some(SessionStatus::Error),
            ..Default::default()
        });
        self.emit(session_id, event).await;
    }

    /// Best-effort teardown of everything a session may hold. Every step is
    /// independently fallible; nothing here ever propagates.
    async fn cleanup(&self, session: &Session) {
        let sid = &session.id;
        if let Some((_, agent)) = self.agents.remove(sid) {
            agent.shutdown().await;
        }
        if let Some(sandbox_id) = &session.sandbox_id {
            if let Err(error) = self.supervisor.stop(sandbox_id, self.config.stop_grace).await {
                tracing::warn!(session_id = %sid, %error, "cleanup: stop failed");
            }
            if let Err(error) = self.supervisor.remove(sandbox_id).await {
                tracing::warn!(session_id = %sid, %error, "cleanup: remove failed");
            }
        }
        if let Some(port) = session.desktop_port {
            if let Err(error) = self.desktop_ports.release(port).await {
                tracing::warn!(session_id = %sid, port, %error, "cleanup: desktop port release failed");
            }
        }
        if let Some(port) = session.tool_port {
            if let Err(error) = self.tool_ports.release(port).await {
                tracing::warn!(session_id = %sid, port, %error, "cleanup: tool port release failed");
            }
        }
    }

    /// Drain hook for the worker runtime: shut every local agent down and
    /// move its session to Terminated.
    pub async fn shutdown_all_agents(&self) {
        let ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        for sid in ids {
            if let Some((_, agent)) = self.agents.remove(&sid) {
                agent.shutdown().await;
            }
            match self.registry.get(&sid).await {
                Ok(Some(session)) => {
                    self.cleanup(&session).await;
                    if !session.status.is_terminal() {
                        if let Err(error) = self
                            .registry
                            .set_status(&sid, SessionStatus::Terminated, None)
                            .await
                        {
                            tracing::warn!(session_id = %sid, %error, "drain: status update failed");
                        }
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(session_id = %sid, %error, "drain: session load failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn load(&self, session_id: &str) -> Result<Session, LifecycleError> {
        self.registry
            .get(session_id)
            .await?
            .ok_or_else(|| LifecycleError::SessionGone(session_id.to_string()))
    }

    async fn patch(&self, session_id: &str, patch: SessionPatch) -> Result<Session, LifecycleError> {
        self.registry
            .update(session_id, patch)
            .await?
            .ok_or_else(|| LifecycleError::SessionGone(session_id.to_string()))
    }

    async fn terminate_raced(&self, session_id: &str) -> Result<bool, LifecycleError> {
        let session = self.load(session_id).await?;
        Ok(matches!(
            session.status,
            SessionStatus::Terminating | SessionStatus::Terminated
        ))
    }

    async fn progress(&self, job: &mut Job, percent: u8) {
        if let Err(error) = self.queue.update_progress(job, percent).await {
            tracing::warn!(job_id = %job.id, percent, %error, "failed to record job progress");
        }
    }

    async fn emit(&self, session_id: &str, event: MessageEvent) {
        EventSink::new(session_id, self.registry.clone(), self.fabric.clone())
            .emit(event)
            .await;
    }

    async fn log(
        &self,
        session_id: &str,
        level: LogLevel,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) {
        if let Err(error) = self
            .registry
            .append_log(session_id, level, message, metadata)
            .await
        {
            tracing::warn!(session_id, %error, "failed to append session log");
        }
    }
}
