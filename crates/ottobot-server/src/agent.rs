//! The agent collaborator contract.
//!
//! The reasoning loop itself is an external collaborator: the plane hands
//! it a session id, the sandbox's tool endpoint and an [`EventSink`], and
//! expects a stream of typed events back. Everything here is the seam:
//! the [`Agent`]/[`AgentFactory`] traits the lifecycle controller drives,
//! the sink that fans events into storage and the chat fabric, and the
//! tool-endpoint connectivity wait. [`EchoAgent`] is the in-repo default
//! used by tests and local runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use ottobot_session::{MessageEvent, MessageFabric, MessageType, SessionRegistry};

pub const TOOL_CONNECT_ATTEMPTS: u32 = 30;
pub const TOOL_CONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool endpoint unavailable at {0}")]
    ToolEndpointUnavailable(String),
    #[error("agent failure: {0}")]
    Failed(String),
    /// Unrecoverable: the session is torn down.
    #[error("fatal agent failure: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Fatal(_) | AgentError::ToolEndpointUnavailable(_)
        )
    }
}

/// Fans one agent event into both halves of the plane: the durable message
/// stream (so reconnecting clients can replay it) and the fabric (so every
/// live subscriber sees it now). Both halves are best-effort; a failing
/// store write must not kill the agent mid-stream.
#[derive(Clone)]
pub struct EventSink {
    session_id: String,
    registry: SessionRegistry,
    fabric: MessageFabric,
}

impl EventSink {
    pub fn new(session_id: &str, registry: SessionRegistry, fabric: MessageFabric) -> Self {
        Self {
            session_id: session_id.to_string(),
            registry,
            fabric,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn emit(&self, event: MessageEvent) {
        if let Err(error) = self.registry.append_message(&self.session_id, &event).await {
            tracing::warn!(
                session_id = %self.session_id,
                %error,
                "failed to store agent event"
            );
        }
        if let Err(error) = self.fabric.publish(&self.session_id, event).await {
            tracing::warn!(
                session_id = %self.session_id,
                %error,
                "failed to broadcast agent event"
            );
        }
    }
}

/// One live agent bound to one session's sandbox.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Drive one user utterance. The agent streams its own events through
    /// the sink it was spawned with; this returns once the turn is over.
    async fn process(&self, prompt: &str) -> Result<(), AgentError>;

    /// Release whatever the agent holds. Called on terminate and drain.
    async fn shutdown(&self);
}

#[async_trait]
pub trait AgentFactory: Send + Sync + 'static {
    async fn spawn(
        &self,
        session_id: &str,
        tool_endpoint: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn Agent>, AgentError>;
}

/// Poll the tool endpoint's health route until it answers. The sandbox's
/// tool layer comes up a moment after the container starts.
pub async fn wait_for_tool_endpoint(
    client: &reqwest::Client,
    base: &str,
    attempts: u32,
    interval: Duration,
) -> Result<(), AgentError> {
    let url = format!("{base}/health");
    for attempt in 1..=attempts.max(1) {
        match client.get(&url).send().await {
            Ok(_) => return Ok(()),
            Err(error) => {
                tracing::debug!(url, attempt, %error, "tool endpoint not answering yet");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(AgentError::ToolEndpointUnavailable(base.to_string()))
}

/// Default collaborator: verifies tool-endpoint connectivity, then answers
/// every prompt with a canned thinking/response pair. Stands in wherever a
/// real reasoning loop is not wired up.
pub struct EchoAgent {
    sink: EventSink,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn process(&self, prompt: &str) -> Result<(), AgentError> {
        self.sink
            .emit(MessageEvent::new(
                MessageType::AgentThinking,
                "Considering the request",
            ))
            .await;
        self.sink
            .emit(MessageEvent::new(
                MessageType::AgentResponse,
                format!("Echo: {prompt}"),
            ))
            .await;
        Ok(())
    }

    async fn shutdown(&self) {}
}

pub struct EchoAgentFactory {
    client: reqwest::Client,
    connect_attempts: u32,
    connect_interval: Duration,
}

impl Default for EchoAgentFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoAgentFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_attempts: TOOL_CONNECT_ATTEMPTS,
            connect_interval: TOOL_CONNECT_INTERVAL,
        }
    }

    /// Shorten (or lengthen) the connectivity wait; tests use one quick
    /// attempt.
    pub fn with_probe(mut self, attempts: u32, interval: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_interval = interval;
        self
    }

    /// Skip the connectivity wait entirely.
    pub fn without_probe(mut self) -> Self {
        self.connect_attempts = 0;
        self
    }
}

#[async_trait]
impl AgentFactory for EchoAgentFactory {
    async fn spawn(
        &self,
        session_id: &str,
        tool_endpoint: &str,
        sink: EventSink,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        if self.connect_attempts > 0 {
            wait_for_tool_endpoint(
                &self.client,
                tool_endpoint,
                self.connect_attempts,
                self.connect_interval,
            )
            .await?;
        }
        tracing::info!(session_id, tool_endpoint, "agent spawned");
        Ok(Arc::new(EchoAgent { sink }))
    }
}
