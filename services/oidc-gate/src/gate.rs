//! Authorization gate middleware
//!
//! Runs in front of every protected route:
//! 1. Resolves the session from its cookie (minting one on first visit)
//! 2. Asks the flow engine whether to admit the request
//! 3. After the handler, inspects the response for a `DownstreamError` and
//!    lets the engine turn a revocation into a forced-consent redirect

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use oidc_flow::redirect;
use oidc_flow::{Admission, Credential, DownstreamError, IdentityClaims, SessionState};
use std::sync::atomic::Ordering;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::error_response;
use crate::metrics;

/// Session cookie attributes
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    /// Mark the cookie `Secure` (set when serving behind https)
    pub secure: bool,
}

/// Identity of an admitted request, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub session_id: String,
    pub user_id: String,
    pub claims: Option<IdentityClaims>,
    pub credential: Option<Credential>,
}

impl AuthenticatedUser {
    fn from_session(session_id: &str, session: &SessionState) -> Self {
        Self {
            session_id: session_id.to_owned(),
            user_id: session.user_id.clone().unwrap_or_default(),
            claims: session.id_token.clone(),
            credential: session.credential.clone(),
        }
    }
}

/// Session id from the jar; a fresh one (with its cookie) when the cookie is
/// missing or not a UUID.
pub fn resolve_session(jar: CookieJar, settings: &CookieSettings) -> (String, CookieJar) {
    let existing = jar
        .get(&settings.name)
        .map(|cookie| cookie.value().to_owned())
        .filter(|value| Uuid::parse_str(value).is_ok());
    if let Some(session_id) = existing {
        return (session_id, jar);
    }

    let session_id = Uuid::new_v4().to_string();
    debug!(session_id = %session_id, "starting new session");
    let cookie = Cookie::build((settings.name.clone(), session_id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(settings.secure);
    (session_id, jar.add(cookie))
}

/// 302 to `location`.
pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_owned())]).into_response()
}

/// Absolute URL of the inbound request, as the browser saw it.
///
/// The scheme comes from `X-Forwarded-Proto` when a proxy sets it.
pub fn request_url(request: &Request, force_https: bool) -> Result<String, url::ParseError> {
    let headers = request.headers();
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    redirect::current_url(scheme, host, path_and_query, force_https)
}

/// Middleware entry point, mounted with `from_fn_with_state`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let (session_id, jar) = resolve_session(jar, &state.cookie);

    let current_url = match request_url(&request, state.force_https) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "cannot reconstruct request URL");
            metrics::record_request(StatusCode::BAD_REQUEST.as_u16());
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "malformed Host header");
        }
    };

    let mut session = state.sessions.load(&session_id).await;
    let response = match state.engine.admit(&mut session, &current_url) {
        Admission::Redirect(location) => {
            state.sessions.save(&session_id, session).await;
            metrics::record_authorization_redirect("initial");
            found(&location)
        }
        Admission::Proceed => {
            let user = AuthenticatedUser::from_session(&session_id, &session);
            // Persist the demoted done flag before the handler runs
            state.sessions.save(&session_id, session).await;
            request.extensions_mut().insert(user);
            let response = next.run(request).await;
            recover_from_failure(&state, &session_id, &current_url, response).await
        }
    };

    metrics::record_request(response.status().as_u16());
    (jar, response).into_response()
}

async fn recover_from_failure(
    state: &AppState,
    session_id: &str,
    current_url: &str,
    response: Response,
) -> Response {
    let Some(failure) = response.extensions().get::<DownstreamError>().cloned() else {
        return response;
    };

    // The handler may have written a renewed credential; start from that
    let mut session = state.sessions.load(session_id).await;
    match state.engine.recover(&mut session, &failure, current_url) {
        Ok(location) => {
            state.sessions.save(session_id, session).await;
            metrics::record_authorization_redirect("revocation");
            found(&location)
        }
        Err(err) => {
            debug!(kind = err.kind(), error = %err, "passing downstream failure through");
            response
        }
    }
}
