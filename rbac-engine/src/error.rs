use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// `Conflict` is recovered locally (re-fetch and retry) by every call site
/// that can race on a unique constraint; it only reaches a caller if the
/// retry budget in that call site is exhausted.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("conflict on unique constraint: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] rbac_shared::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    /// Fatal errors refuse to let the engine continue operating (registry
    /// misuse, unsupported primary-key types). Everything else is a normal,
    /// recoverable request-time failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}
