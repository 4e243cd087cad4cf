//! Operation-boundary error type.
//!
//! Query plumbing uses `anyhow` internally; operations that the HTTP layer
//! exposes return [`ControlError`] so callers can distinguish unknown
//! entities (404) and state-machine violations (400) from genuine failures.

/// Error returned by control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The entity exists but is not in a state that permits the operation.
    #[error("bad state: {0}")]
    BadState(String),

    /// The request itself is malformed.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Anything else -- database failures, coordination failures.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ControlError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn bad_state(msg: impl std::fmt::Display) -> Self {
        Self::BadState(msg.to_string())
    }

    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::Invalid(msg.to_string())
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
