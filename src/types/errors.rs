//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Backend application failures are not
//! errors at this level; they travel in-band as tool results.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// JSON-RPC code for an invocation that ran out of time.
pub const RPC_TIMEOUT: i64 = -32001;
/// JSON-RPC code for an invocation abandoned because its session closed.
pub const RPC_CANCELLED: i64 = -32002;
/// JSON-RPC code for an unknown tool or function.
pub const RPC_NOT_FOUND: i64 = -32004;
/// JSON-RPC invalid params.
pub const RPC_INVALID_PARAMS: i64 = -32602;
/// JSON-RPC internal error.
pub const RPC_INTERNAL: i64 = -32603;

/// Main error enum for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed declaration payload.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Referenced record not found in the watch cache.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cache listing failed while rebuilding a scope.
    #[error("rebuild error: {0}")]
    Rebuild(String),

    /// Validation errors (bad request shapes, bad flags).
    #[error("validation error: {0}")]
    Validation(String),

    /// Invocation exceeded its timeout budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invocation abandoned because the caller went away.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The backend substrate refused the submission.
    #[error("backend error: {0}")]
    Backend(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to a JSON-RPC error code for the session front.
    pub fn to_rpc_code(&self) -> i64 {
        match self {
            Error::Timeout(_) => RPC_TIMEOUT,
            Error::Cancelled(_) => RPC_CANCELLED,
            Error::NotFound(_) => RPC_NOT_FOUND,
            Error::Validation(_) | Error::Serialization(_) => RPC_INVALID_PARAMS,
            Error::ConfigParse(_)
            | Error::Rebuild(_)
            | Error::Backend(_)
            | Error::Internal(_)
            | Error::Io(_) => RPC_INTERNAL,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn config_parse(msg: impl Into<String>) -> Self {
        Self::ConfigParse(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn rebuild(msg: impl Into<String>) -> Self {
        Self::Rebuild(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
