pub mod error;
pub mod fabric;
pub mod models;
pub mod ports;
pub mod queue;
pub mod registry;

pub use error::{SessionError, SessionResult};
pub use fabric::{FabricSubscription, MessageFabric};
pub use models::{
    Environment, EventMetadata, Job, JobKind, LogLevel, MessageEvent, MessageType, Session,
    SessionLogEntry, SessionPatch, SessionStatus, WorkerEntry, WorkerStatus,
};
pub use ports::{PortAllocator, PortKind, PortRange};
pub use queue::{QueueConfig, WorkQueue};
pub use registry::SessionRegistry;
