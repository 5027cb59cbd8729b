//! Provider callback and logout endpoints

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use oidc_flow::CallbackParams;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use tracing::{info, instrument, warn};

use crate::AppState;
use crate::error::FlowRejection;
use crate::gate::{found, resolve_session};
use crate::metrics;

/// Query string of the provider's redirect back to us.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user declines consent
    pub error: Option<String>,
}

/// `GET <callback path>`: complete the in-flight flow and bounce the browser
/// back to where it started.
#[instrument(skip_all)]
pub async fn callback_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = &query.error {
        warn!(provider_error = %error, "provider returned an error to the callback");
    }

    let (session_id, jar) = resolve_session(jar, &state.cookie);
    let mut session = state.sessions.load(&session_id).await;
    let params = CallbackParams {
        code: query.code,
        state: query.state,
    };

    let result = state.engine.complete_callback(&mut session, &params).await;
    state.sessions.save(&session_id, session).await;

    let response = match result {
        Ok(outcome) => {
            metrics::record_callback("success");
            state.metrics.flows_completed.fetch_add(1, Ordering::Relaxed);
            found(&outcome.redirect_to)
        }
        Err(err) => {
            warn!(kind = err.kind(), error = %err, "callback rejected");
            metrics::record_callback(err.kind());
            FlowRejection(err).into_response()
        }
    };
    metrics::record_request(response.status().as_u16());
    (jar, response).into_response()
}

/// Anything but GET on the callback path.
pub async fn callback_not_supported() -> Response {
    (StatusCode::FORBIDDEN, "Not supported").into_response()
}

/// `GET /logout`: forget the completed flow for this session.
pub async fn logout_handler(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (session_id, jar) = resolve_session(jar, &state.cookie);
    let mut session = state.sessions.load(&session_id).await;
    let user_id = session.user_id.clone();
    state.engine.clear(&mut session);
    state.sessions.save(&session_id, session).await;

    info!(user_id = ?user_id, "signed out");
    (
        jar,
        axum::Json(serde_json::json!({ "status": "signed_out" })),
    )
        .into_response()
}
