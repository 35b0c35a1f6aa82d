use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a session. Terminated and Error are terminal; a
/// session never leaves a terminal status.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Ready,
    Running,
    Terminating,
    Terminated,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Terminating => "terminating",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Preset selection for the sandbox image. Opaque to the orchestration
/// plane; the supervisor maps it to an image tag.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    #[default]
    Node,
    Python,
    FullStack,
    DataScience,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Node => "node",
            Environment::Python => "python",
            Environment::FullStack => "full-stack",
            Environment::DataScience => "data-science",
        }
    }
}

/// Durable session record, stored as JSON under `session:<id>`.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub initial_prompt: String,
    #[serde(default)]
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub desktop_port: Option<u16>,
    #[serde(default)]
    pub tool_port: Option<u16>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Generate a session id: 12 lowercase hex chars, globally unique.
pub fn new_session_id() -> String {
    let id = Uuid::new_v4();
    let mut buffer = Uuid::encode_buffer();
    let encoded = id.as_simple().encode_lower(&mut buffer);
    encoded[..12].to_string()
}

/// Partial update applied to a session record. Unset fields are left as-is;
/// `error` is only ever set together with `status = Error`.
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub desktop_port: Option<u16>,
    pub tool_port: Option<u16>,
    pub sandbox_id: Option<String>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.desktop_port.is_none()
            && self.tool_port.is_none()
            && self.sandbox_id.is_none()
            && self.worker_id.is_none()
            && self.error.is_none()
    }
}

/// Kind of a chat event.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserPrompt,
    AgentThinking,
    AgentAction,
    AgentResponse,
    SystemUpdate,
    DownloadReady,
    Error,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema, PartialEq)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_status: Option<SessionStatus>,
}

impl EventMetadata {
    fn is_empty(&self) -> bool {
        self == &EventMetadata::default()
    }
}

/// Typed record emitted on a session's chat channel.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct MessageEvent {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl MessageEvent {
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        if !metadata.is_empty() {
            self.metadata = Some(metadata);
        }
        self
    }

    pub fn user_prompt(content: impl Into<String>) -> Self {
        Self::new(MessageType::UserPrompt, content)
    }

    pub fn system_update(content: impl Into<String>) -> Self {
        Self::new(MessageType::SystemUpdate, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageType::Error, content)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// One entry in a session's bounded log stream.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
pub struct SessionLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Lifecycle work scheduled through the durable queue.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CreateSession,
    ProcessMessage,
    TerminateSession,
}

impl JobKind {
    /// Queue priority. Lower value is served first; see `queue.rs` for the
    /// starvation guard that keeps terminate jobs moving under load.
    pub fn priority(self) -> u8 {
        match self {
            JobKind::CreateSession | JobKind::ProcessMessage => 1,
            JobKind::TerminateSession => 2,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobKind::CreateSession => "create_session",
            JobKind::ProcessMessage => "process_message",
            JobKind::TerminateSession => "terminate_session",
        };
        f.write_str(label)
    }
}

/// Durable job record, stored as JSON under `queue:job:<id>`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub session_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: u8,
    /// Delivery attempts so far; incremented when a worker claims the job.
    #[serde(default)]
    pub attempts: u32,
    /// Times the job was re-queued after a lease lapse.
    #[serde(default)]
    pub stalls: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the job may be claimed (retry backoff).
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, session_id: &str, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().as_simple().to_string(),
            kind,
            session_id: session_id.to_string(),
            payload,
            priority: kind.priority(),
            attempts: 0,
            stalls: 0,
            created_at: now,
            run_at: now,
            progress: 0,
            worker_id: None,
            error: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Stopping,
    Stopped,
}

/// Worker presence record under `worker:<id>:status`, TTL-bounded so a
/// crashed worker disappears on its own.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerEntry {
    pub id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}
