//! HTTP mapping of flow and downstream failures

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use oidc_flow::{DownstreamError, FlowError};

/// JSON error body: {"error":{"type":"...","message":"..."}}
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Terminal flow error rendered with the status its variant maps to.
pub struct FlowRejection(pub FlowError);

impl IntoResponse for FlowRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        error_response(status, self.0.kind(), &self.0.to_string())
    }
}

/// A failed protected call.
///
/// Answers 502 and carries the `DownstreamError` in the response extensions
/// so the gate can classify it after the handler returns.
pub struct DownstreamFailure(pub DownstreamError);

impl IntoResponse for DownstreamFailure {
    fn into_response(self) -> Response {
        let mut response =
            error_response(StatusCode::BAD_GATEWAY, "downstream_error", &self.0.to_string());
        response.extensions_mut().insert(self.0);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn state_mismatch_renders_403_with_kind() {
        let response = FlowRejection(FlowError::StateTokenMismatch).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "state_mismatch");
    }

    #[tokio::test]
    async fn identity_failure_renders_500() {
        let response = FlowRejection(FlowError::IdentityVerificationFailure).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn downstream_failure_keeps_error_in_extensions() {
        let err = DownstreamError::Resource {
            status: 401,
            body: "Invalid Credentials".into(),
        };
        let response = DownstreamFailure(err.clone()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.extensions().get::<DownstreamError>(), Some(&err));
    }
}
