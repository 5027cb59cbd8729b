//! Error taxonomy for the authorization flow

use crate::revocation::DownstreamError;
use crate::token::ExchangeError;

/// Terminal and recoverable outcomes of the flow engine.
///
/// The first four variants end the current request with a client-visible
/// error. `RevocationDetected` is recovered by the middleware with a
/// forced-consent redirect. `UnclassifiedDownstreamFailure` is passed
/// through untouched.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("callback is missing the 'code' or 'state' parameter")]
    MissingCallbackParameters,

    #[error("OAuth2 state token is invalid")]
    StateTokenMismatch,

    #[error("token exchange failed: {0}")]
    TokenExchangeFailure(#[from] ExchangeError),

    #[error("identity token verification failed")]
    IdentityVerificationFailure,

    #[error("token revocation detected: {0}")]
    RevocationDetected(DownstreamError),

    #[error("downstream failure: {0}")]
    UnclassifiedDownstreamFailure(DownstreamError),
}

impl FlowError {
    /// HTTP status the gate answers with when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingCallbackParameters
            | Self::StateTokenMismatch
            | Self::TokenExchangeFailure(_) => 403,
            Self::IdentityVerificationFailure => 500,
            Self::RevocationDetected(_) => 401,
            Self::UnclassifiedDownstreamFailure(_) => 502,
        }
    }

    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCallbackParameters => "missing_parameters",
            Self::StateTokenMismatch => "state_mismatch",
            Self::TokenExchangeFailure(_) => "exchange_failed",
            Self::IdentityVerificationFailure => "identity_invalid",
            Self::RevocationDetected(_) => "revoked",
            Self::UnclassifiedDownstreamFailure(_) => "downstream",
        }
    }
}

/// Errors from refresh-token persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("refresh token file parse error: {0}")]
    Parse(String),
}

/// Result alias for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;
