use skein_core::approval::UnknownToken;
use skein_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session {session} cannot transition out of status {status}")]
    NotSuspendable { session: String, status: String },

    #[error("phase {phase} is missing required inputs: {missing:?}")]
    Validation { phase: String, missing: Vec<String> },

    #[error("approval {0} was already resolved")]
    AlreadyResolved(String),

    #[error("approval {0} expired before resolution")]
    ApprovalExpired(String),

    #[error("approval {0} still pending when the wait timed out")]
    ApprovalTimeout(String),

    #[error(transparent)]
    UnknownResolution(#[from] UnknownToken),

    #[error("observer channel capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}
