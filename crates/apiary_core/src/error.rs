//! Error taxonomy for the coordination bus.
//!
//! Four caller-visible classes: validation (the request is malformed), auth
//! (the request is well-formed but not proven), not-found, and storage (the
//! only server-side fault). The HTTP layer maps these onto status codes;
//! everything else in the workspace just returns them.

use thiserror::Error;

/// Why an authentication step failed. Every variant maps to HTTP 401; the
/// distinction exists for logs and for callers that want a stable reason
/// code without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("challenge not found")]
    ChallengeNotFound,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("challenge binding mismatch")]
    BindingMismatch,
    #[error("timestamp missing, unparseable, or outside allowed clock skew")]
    ClockSkew,
    #[error("invalid or missing device proof")]
    DeviceProof,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid or expired session")]
    InvalidSession,
}

/// Top-level error for every fallible bus operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiaryError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Auth(#[from] AuthFailure),

    #[error("{0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ApiaryError {
    /// Shorthand for a validation rejection.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable machine-readable class, used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Auth(_) => "authentication_error",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
        }
    }

    /// True for the one class that is the server's fault rather than the
    /// caller's.
    pub fn is_server_fault(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
