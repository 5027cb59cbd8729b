//! Token endpoint interactions
//!
//! Two grants hit the provider's token endpoint:
//! 1. `authorization_code`: one-shot exchange at the end of the callback
//! 2. `refresh_token`: renewal of an expired access token
//!
//! Neither is retried here. Authorization codes are single-use, so a retry
//! with the same code could only ever produce `invalid_grant`.

use std::fmt;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::BoxFuture;
use crate::constants::INVALID_GRANT;

/// Successful response to an authorization-code exchange.
///
/// `refresh_token` is only present on first consent or forced re-consent.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub id_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("id_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Response to a refresh-token grant. Providers may rotate the refresh token.
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for RefreshResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Token endpoint failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status} ({error}): {body}")]
    Provider {
        status: u16,
        /// OAuth2 `error` code from the body, or "unknown"
        error: String,
        body: String,
    },

    #[error("invalid token response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Code already redeemed, expired, or refresh token revoked.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::Provider { error, .. } if error == INVALID_GRANT)
    }
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: String,
}

/// Abstraction over the token endpoint so the engine can be driven by a
/// stub in tests. `Pin<Box<dyn Future>>` keeps it usable as `Arc<dyn _>`.
pub trait CodeExchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenResponse, ExchangeError>>;

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<RefreshResponse, ExchangeError>>;
}

/// reqwest-backed token endpoint client authenticating with the client
/// secret in the form body (`client_secret_post`).
pub struct TokenExchanger {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Secret<String>,
}

impl TokenExchanger {
    pub fn new(
        client: reqwest::Client,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Secret<String>,
    ) -> Self {
        Self {
            client,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Exchange an authorization code for tokens.
    #[instrument(skip_all, fields(endpoint = %self.token_endpoint, pkce = code_verifier.is_some()))]
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, ExchangeError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_str()),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let response = self.post_form(&form).await?;
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ExchangeError::Malformed(format!("{e}")))?;
        debug!(
            has_refresh_token = token.refresh_token.is_some(),
            "authorization code exchanged"
        );
        Ok(token)
    }

    /// Obtain a new access token with a refresh token.
    #[instrument(skip_all, fields(endpoint = %self.token_endpoint))]
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshResponse, ExchangeError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_str()),
        ];
        let response = self.post_form(&form).await?;
        response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| ExchangeError::Malformed(format!("{e}")))
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<reqwest::Response, ExchangeError> {
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "token endpoint unreachable");
                ExchangeError::Http(format!("{e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        let error = serde_json::from_str::<ProviderErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from("unknown"));
        if error == INVALID_GRANT {
            warn!(%status, "token endpoint rejected grant; code reused or token revoked");
        } else {
            warn!(%status, error = %error, "token endpoint returned an error");
        }
        Err(ExchangeError::Provider {
            status: status.as_u16(),
            error,
            body,
        })
    }
}

impl CodeExchange for TokenExchanger {
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
        code_verifier: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenResponse, ExchangeError>> {
        Box::pin(self.exchange_code(code, redirect_uri, code_verifier))
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<RefreshResponse, ExchangeError>> {
        Box::pin(self.refresh_access_token(refresh_token))
    }
}
