//! Engine error taxonomy.
//!
//! Every core operation returns `Result<T, EngineError>`. Callers branch on
//! [`EngineError::kind`] rather than on message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orders::ClientToken;

/// Errors surfaced by the governor, ledger, coordinator, reconciler and facade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Local validation failure; the gateway was never contacted
    #[error("Invalid order parameters: {0}")]
    InvalidOrderParameters(String),

    /// Request budget exhausted within the bounded wait
    #[error("Rate limited: {operation}")]
    RateLimited { operation: String },

    /// Network or gateway instability after exhausting retries.
    ///
    /// When `unknown_outcome` is set the request may have been applied by the
    /// exchange; query status by `client_token` before retrying the intent.
    #[error("Transient failure during {operation}: {message}")]
    Transient {
        operation: String,
        message: String,
        unknown_outcome: bool,
        client_token: Option<ClientToken>,
    },

    /// Exchange-level business rejection (not retried)
    #[error("Rejected by exchange: {reason}")]
    Rejected { reason: String, code: Option<i64> },

    /// Unknown client token or exchange id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication or permission failure; trading calls stay halted until
    /// the operator clears it
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Flat discriminant of [`EngineError`] for callers that only branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidOrderParameters,
    RateLimited,
    Transient,
    Rejected,
    NotFound,
    Fatal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidOrderParameters(_) => ErrorKind::InvalidOrderParameters,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOrderParameters(msg.into())
    }

    /// True when the underlying action may have taken effect on the exchange.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(
            self,
            Self::Transient {
                unknown_outcome: true,
                ..
            }
        )
    }

    /// Attach the client token of the submit this error belongs to.
    #[must_use]
    pub fn with_client_token(self, token: &ClientToken) -> Self {
        match self {
            Self::Transient {
                operation,
                message,
                unknown_outcome,
                ..
            } => Self::Transient {
                operation,
                message,
                unknown_outcome,
                client_token: Some(token.clone()),
            },
            other => other,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOrderParameters => write!(f, "InvalidOrderParameters"),
            Self::RateLimited => write!(f, "RateLimited"),
            Self::Transient => write!(f, "Transient"),
            Self::Rejected => write!(f, "Rejected"),
            Self::NotFound => write!(f, "NotFound"),
            Self::Fatal => write!(f, "Fatal"),
        }
    }
}
