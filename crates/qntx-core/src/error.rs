//! Error taxonomy shared across the QNTX server core.
//!
//! Names are contracts (spec §7): callers match on variant, not on message
//! text. The HTTP layer (in `qntx-server`) maps each variant to a status
//! code via a single dispatch; this enum carries no HTTP knowledge itself.

use thiserror::Error;

/// Canonical error taxonomy for the QNTX server core.
#[derive(Debug, Clone, Error)]
pub enum QntxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("handler unavailable: {0}")]
    HandlerUnavailable(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Result type used throughout the core crates.
pub type QntxResult<T> = Result<T, QntxError>;

/// Ordered context accumulated by wrapping, surfaced to clients as the JSON
/// body's `details` array (spec §7). Mirrors `anyhow::Context`'s chaining
/// but keeps the chain as plain strings so it can ride alongside a
/// `QntxError` without boxing the source.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails(pub Vec<String>);

impl ErrorDetails {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(mut self, ctx: impl Into<String>) -> Self {
        self.0.push(ctx.into());
        self
    }
}

impl From<Vec<String>> for ErrorDetails {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}
