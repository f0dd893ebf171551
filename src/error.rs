//! Domain error type shared by the service modules.
//!
//! Service functions return [`KbResult`]; the HTTP layer maps each variant
//! to a status code and machine-readable `code` (see [`KbError::code`]).
//! CLI commands simply propagate these through `anyhow`.

use thiserror::Error;

pub type KbResult<T> = std::result::Result<T, KbError>;

#[derive(Debug, Error)]
pub enum KbError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("token expired")]
    TokenExpired,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    /// A feature that needs a provider (embeddings, llm) is switched off.
    #[error("{0}")]
    Disabled(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl KbError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        KbError::BadRequest(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        KbError::NotFound(what.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        KbError::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        KbError::Conflict(msg.into())
    }

    /// Machine-readable error code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::BadRequest(_) => "bad_request",
            KbError::Unauthorized(_) => "unauthorized",
            KbError::TokenExpired => "token_expired",
            KbError::Forbidden(_) => "forbidden",
            KbError::NotFound(_) => "not_found",
            KbError::Conflict(_) => "conflict",
            KbError::PayloadTooLarge(_) => "payload_too_large",
            KbError::Disabled(_) => "disabled",
            KbError::Upstream(_) => "upstream_error",
            KbError::Database(_) | KbError::Internal(_) => "internal",
        }
    }
}

/// True for a UNIQUE or PRIMARY KEY constraint failure.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
