//! Sandbox supervision.
//!
//! A sandbox is one container per session: it exposes the remote desktop on
//! one published port and the tool endpoint on another, and mounts the
//! session workspace from the host. The [`Supervisor`] trait is the seam the
//! lifecycle controller drives; [`docker::DockerSupervisor`] is the shipped
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod docker;

pub use docker::DockerSupervisor;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("sandbox desktop on port {port} not ready after {waited_secs}s")]
    ReadinessTimeout { port: u16, waited_secs: u64 },
    #[error("sandbox {0} exited before becoming ready")]
    ExitedEarly(String),
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Everything the runtime needs to materialize one sandbox.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub session_id: String,
    /// Environment preset tag; resolved to an image by the supervisor.
    pub environment: String,
    pub desktop_port: u16,
    pub tool_port: u16,
}

/// Handle to a materialized sandbox.
#[derive(Clone, Debug)]
pub struct SandboxDescriptor {
    pub sandbox_id: String,
    pub session_id: String,
    pub desktop_port: u16,
    pub tool_port: u16,
    pub created_at: DateTime<Utc>,
    pub memory_limit: String,
    pub cpu_shares: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Running,
    Exited,
    Unknown,
}

#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    /// Materialize a container for the spec. Returns its descriptor; the
    /// container is created but not started.
    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<SandboxDescriptor>;

    /// Start a created container. Starting a running container is a no-op.
    async fn start(&self, sandbox_id: &str) -> SandboxResult<()>;

    /// Stop with a grace period. "Already stopped" and "not found" are
    /// not errors.
    async fn stop(&self, sandbox_id: &str, grace: Duration) -> SandboxResult<()>;

    /// Force-remove. "Not found" is not an error.
    async fn remove(&self, sandbox_id: &str) -> SandboxResult<()>;

    async fn status(&self, sandbox_id: &str) -> SandboxResult<SandboxState>;

    /// Block until the desktop proxy answers HTTP on `desktop_port`, polling
    /// once a second up to `max_wait`. Any HTTP response counts: the probe
    /// proves the port proxy is up, not that the page renders. Fails early
    /// if the container is observed to have exited.
    async fn wait_for_desktop(
        &self,
        sandbox_id: &str,
        desktop_port: u16,
        max_wait: Duration,
    ) -> SandboxResult<()>;

    /// Remove managed containers older than `older_than`. Returns how many
    /// were removed.
    async fn reap_stale(&self, older_than: Duration) -> SandboxResult<usize>;

    /// Whether the container runtime answers at all; drives /health.
    async fn available(&self) -> bool;
}

/// Fallback used when the container runtime cannot be reached at startup:
/// the process still serves traffic (listing, chat history, health report
/// the degradation) but every sandbox operation fails loudly.
pub struct UnavailableSupervisor {
    reason: String,
}

impl UnavailableSupervisor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> SandboxError {
        SandboxError::Unavailable(self.reason.clone())
    }
}

#[async_trait]
impl Supervisor for UnavailableSupervisor {
    async fn create(&self, _spec: &SandboxSpec) -> SandboxResult<SandboxDescriptor> {
        Err(self.error())
    }

    async fn start(&self, _sandbox_id: &str) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn stop(&self, _sandbox_id: &str, _grace: Duration) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn remove(&self, _sandbox_id: &str) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn status(&self, _sandbox_id: &str) -> SandboxResult<SandboxState> {
        Err(self.error())
    }

    async fn wait_for_desktop(
        &self,
        _sandbox_id: &str,
        _desktop_port: u16,
        _max_wait: Duration,
    ) -> SandboxResult<()> {
        Err(self.error())
    }

    async fn reap_stale(&self, _older_than: Duration) -> SandboxResult<usize> {
        Err(self.error())
    }

    async fn available(&self) -> bool {
        false
    }
}
