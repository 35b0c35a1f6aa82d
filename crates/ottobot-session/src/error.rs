use thiserror::Error;

use ottobot_store::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("no available {0} port")]
    PortsExhausted(&'static str),
    #[error("corrupt record under '{key}': {detail}")]
    Corrupt { key: String, detail: String },
    #[error("publish on session {session_id} failed: {detail}")]
    Publish { session_id: String, detail: String },
}

impl SessionError {
    pub fn corrupt(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            detail: err.to_string(),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
