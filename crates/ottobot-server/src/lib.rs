pub mod agent;
pub mod api;
pub mod chat;
pub mod config;
pub mod lifecycle;
pub mod reapers;
pub mod worker;

pub use agent::{Agent, AgentError, AgentFactory, EchoAgentFactory, EventSink};
pub use api::{build_router, AppState};
pub use config::Config;
pub use lifecycle::{Lifecycle, LifecycleConfig, LifecycleError};
pub use worker::{WorkerConfig, WorkerRuntime};

pub const DEFAULT_API_PORT: u16 = 3000;
