//! Revocation detection for failures of authenticated calls
//!
//! A revoked grant is only observable after the fact, when a call that
//! used it fails with a recognizable signature:
//!
//! - the token endpoint answers `invalid_grant` (refresh token revoked or
//!   expired)
//! - a resource server answers "Invalid Credentials" (access token no
//!   longer honored and no working refresh token behind it)
//!
//! Everything else is an ordinary failure and is passed through.

use crate::constants::{INVALID_CREDENTIALS, INVALID_GRANT};
use crate::token::ExchangeError;

/// Failure of a call made with the session's credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamError {
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("resource returned {status}: {body}")]
    Resource { status: u16, body: String },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<ExchangeError> for DownstreamError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Provider { status, body, .. } => Self::TokenEndpoint { status, body },
            ExchangeError::Http(msg) => Self::Transport(msg),
            ExchangeError::Malformed(msg) => Self::TokenEndpoint {
                status: 200,
                body: msg,
            },
        }
    }
}

/// True when `err` says the user's grant is gone and a fresh consent is
/// the only way forward.
pub fn is_revocation(err: &DownstreamError) -> bool {
    match err {
        DownstreamError::TokenEndpoint { body, .. } => body.contains(INVALID_GRANT),
        DownstreamError::Resource { body, .. } => body.contains(INVALID_CREDENTIALS),
        DownstreamError::Transport(_) => false,
    }
}

/// Result of running a protected call, classified for the middleware.
#[derive(Debug)]
pub enum ProtectedOutcome<T> {
    Ok(T),
    RevocationDetected(DownstreamError),
    OtherFailure(DownstreamError),
}

impl<T> ProtectedOutcome<T> {
    pub fn classify(result: Result<T, DownstreamError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) if is_revocation(&err) => Self::RevocationDetected(err),
            Err(err) => Self::OtherFailure(err),
        }
    }
}

impl<T> From<Result<T, DownstreamError>> for ProtectedOutcome<T> {
    fn from(result: Result<T, DownstreamError>) -> Self {
        Self::classify(result)
    }
}
