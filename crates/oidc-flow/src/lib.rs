//! OpenID Connect Authorization Code flow engine
//!
//! Gates protected resources behind a browser-redirect login with an
//! identity provider. The crate has no HTTP server of its own; a host
//! application feeds it session state and request URLs and acts on the
//! redirects and errors it returns.
//!
//! Flow:
//! 1. `FlowEngine::admit` sees a session that is not done, captures the
//!    requested URL, issues a state token (and PKCE verifier) and returns the
//!    authorization URL
//! 2. The provider redirects back; `FlowEngine::complete_callback` consumes
//!    the state token, exchanges the code via `CodeExchange`, verifies the
//!    identity token via `IdentityVerifier`, saves the refresh token and
//!    marks the session done
//! 3. Protected calls that fail are classified by `revocation::is_revocation`;
//!    `FlowEngine::recover` turns a revocation into a forced-consent redirect

use std::future::Future;
use std::pin::Pin;

pub mod authorize;
pub mod constants;
pub mod credential;
pub mod error;
pub mod flow;
pub mod identity;
pub mod pkce;
pub mod redirect;
pub mod refresh_store;
pub mod revocation;
pub mod session;
pub mod state_token;
pub mod token;

/// Boxed future returned by the object-safe strategy traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use authorize::AuthorizationRequestBuilder;
pub use credential::Credential;
pub use error::{FlowError, Result, StoreError};
pub use flow::{
    Admission, CallbackOutcome, CallbackParams, FlowComponents, FlowEngine, FlowPolicy,
    RedirectUriProvider, Resolution, ScopeProvider,
};
pub use identity::{IdentityClaims, IdentityVerifier, JwksVerifier};
pub use refresh_store::{FileRefreshTokenStore, InMemoryRefreshTokenStore, RefreshTokenStore};
pub use revocation::{DownstreamError, ProtectedOutcome, is_revocation};
pub use session::{
    FlowPhase, InMemorySessionStore, SessionState, SessionStore, spawn_session_sweeper,
};
pub use token::{CodeExchange, ExchangeError, TokenExchanger, TokenResponse};
