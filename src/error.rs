use crate::model::SessionStatus;

/// Errors reported synchronously to whoever drives a session.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("session {session_id} is already active for this owner")]
    Conflict { session_id: String },
    #[error("cannot {action} a session that is {status}")]
    InvalidState {
        action: &'static str,
        status: SessionStatus,
    },
    #[error("a capture scheduler is already attached to session {session_id}")]
    AlreadyRunning { session_id: String },
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("no session has been started")]
    NoSession,
    #[error("session {session_id} does not exist")]
    UnknownSession { session_id: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
