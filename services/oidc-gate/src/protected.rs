//! Sample protected resources behind the gate
//!
//! `/me` calls the provider's userinfo endpoint with the session's access
//! token. A token already known to be expired is renewed first. A 401 is
//! retried once after renewing through the refresh token;
//! whatever still fails is handed back to the gate as a `DownstreamError`.

use axum::Extension;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use oidc_flow::{Credential, DownstreamError};
use tracing::{debug, instrument, warn};

use crate::AppState;
use crate::error::DownstreamFailure;
use crate::gate::AuthenticatedUser;

/// `GET /`: who the gate thinks you are.
pub async fn index_handler(Extension(user): Extension<AuthenticatedUser>) -> Response {
    let email = user.claims.as_ref().and_then(|c| c.email.clone());
    axum::Json(serde_json::json!({
        "user_id": user.user_id,
        "email": email,
    }))
    .into_response()
}

/// `GET /me`: the provider's userinfo document for the signed-in user.
#[instrument(skip_all, fields(user_id = %user.user_id))]
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    match fetch_profile(&state, &user).await {
        Ok(profile) => axum::Json(profile).into_response(),
        Err(failure) => {
            warn!(error = %failure, "userinfo call failed");
            DownstreamFailure(failure).into_response()
        }
    }
}

async fn fetch_profile(
    state: &AppState,
    user: &AuthenticatedUser,
) -> Result<serde_json::Value, DownstreamError> {
    let Some(credential) = user.credential.as_ref() else {
        return Err(DownstreamError::Resource {
            status: 401,
            body: "session has no credential".into(),
        });
    };

    if credential.is_expired() && credential.can_renew() {
        debug!("access token expired, renewing before the call");
        if let Some(renewed) = state.engine.renew(&user.user_id, credential).await? {
            store_credential(state, &user.session_id, &renewed).await;
            return fetch_userinfo(state, &renewed).await;
        }
    }

    match fetch_userinfo(state, credential).await {
        Err(DownstreamError::Resource { status: 401, body }) => {
            let Some(renewed) = state.engine.renew(&user.user_id, credential).await? else {
                debug!("no refresh token to renew with");
                return Err(DownstreamError::Resource { status: 401, body });
            };
            store_credential(state, &user.session_id, &renewed).await;
            fetch_userinfo(state, &renewed).await
        }
        other => other,
    }
}

async fn fetch_userinfo(
    state: &AppState,
    credential: &Credential,
) -> Result<serde_json::Value, DownstreamError> {
    let response = state
        .http
        .get(&state.userinfo_endpoint)
        .bearer_auth(credential.bearer())
        .send()
        .await
        .map_err(|e| DownstreamError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| DownstreamError::Transport(e.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(DownstreamError::Resource { status, body });
    }

    serde_json::from_str(&body).map_err(|e| DownstreamError::Resource {
        status,
        body: format!("invalid userinfo response: {e}"),
    })
}

async fn store_credential(state: &AppState, session_id: &str, credential: &Credential) {
    let mut session = state.sessions.load(session_id).await;
    session.credential = Some(credential.clone());
    state.sessions.save(session_id, session).await;
}
