use thiserror::Error;

/// Convenience type alias for Results with HubError
pub type Result<T> = std::result::Result<T, HubError>;

/// Main error type for the A2A hub
///
/// Covers the protocol-level failure modes (validation, unreachable agents,
/// dispatch failures, illegal task transitions) plus the infrastructure
/// errors wrapped from the underlying crates.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent unreachable: {0}")]
    UnreachableAgent(String),

    #[error("no suitable agents")]
    NoSuitableAgent,

    #[error("delegation failed: {0}")]
    DelegationFailed(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("outbound request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
