//! Error taxonomy for the council subsystem.
//!
//! Every variant is scoped to a single request or a single maintenance cycle;
//! none of them is meant to take the process down.

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("advisor '{advisor}' timed out after {after_ms} ms")]
    AdvisorTimeout { advisor: String, after_ms: u64 },

    #[error("advisor '{advisor}' failed: {reason}")]
    AdvisorFailure { advisor: String, reason: String },

    #[error("every advisor selected for request {request_id} failed")]
    RoutingFailed { request_id: String },

    #[error("ledger entry ({advisor}, {tag}) kept changing underneath {attempts} update attempts")]
    LedgerWriteConflict {
        advisor: String,
        tag: String,
        attempts: u32,
    },

    #[error("memory append failed: {0}")]
    MemoryAppendFailure(String),

    #[error("request was canceled")]
    Canceled,

    #[error("unknown advisor '{0}'")]
    UnknownAdvisor(String),

    #[error("advisor '{0}' is already registered")]
    DuplicateAdvisor(String),

    #[error("no turn is awaiting feedback for request {0}")]
    UnknownRequest(String),

    #[error("evolution state error: {0}")]
    State(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CouncilError>;

impl CouncilError {
    /// True for the per-advisor failures the router absorbs into the trace.
    pub fn is_advisor_scoped(&self) -> bool {
        matches!(
            self,
            CouncilError::AdvisorTimeout { .. }
                | CouncilError::AdvisorFailure { .. }
                | CouncilError::Engine(_)
        )
    }
}
