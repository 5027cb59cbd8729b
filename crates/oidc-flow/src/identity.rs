//! Identity token verification
//!
//! Verifies the RS256 signature of the `id_token` against the provider's
//! published JWKS, then the standard claims (issuer, audience, expiry).
//! Any failure yields `None`: a bad identity token is an expected outcome
//! that ends the flow, not a bug.
//!
//! Signing keys are cached across calls behind an async `RwLock` and
//! refetched when the cache expires (`Cache-Control: max-age`) or when a
//! token names a `kid` the cache doesn't know (provider key rotation).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::token::TokenResponse;

/// Key cache lifetime when the JWKS response carries no max-age
const DEFAULT_KEYS_MAX_AGE: Duration = Duration::from_secs(3600);

/// Upper bound on a provider-advertised key cache lifetime
const MAX_KEYS_MAX_AGE: Duration = Duration::from_secs(86_400);

/// Claims extracted from a verified identity token.
///
/// Only `sub` outlives the callback (as the session's user id); the rest is
/// kept for display and auditing.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityClaims {
    /// Provider's stable, never-reused user identifier
    pub sub: String,
    pub iss: String,
    pub exp: u64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
}

impl IdentityClaims {
    pub fn subject(&self) -> &str {
        &self.sub
    }
}

/// Verifies the identity part of a token response.
pub trait IdentityVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a TokenResponse) -> BoxFuture<'a, Option<IdentityClaims>>;
}

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error("malformed or invalid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    #[error("signing keys unavailable: {0}")]
    Keys(String),

    #[error("no signing key matches kid {0:?}")]
    UnknownKey(Option<String>),

    #[error("sub claim is empty")]
    EmptySubject,
}

struct KeyCache {
    keyed: HashMap<String, DecodingKey>,
    unkeyed: Vec<DecodingKey>,
    expires_at: Instant,
}

impl KeyCache {
    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        match kid {
            Some(kid) => self.keyed.get(kid).cloned(),
            // Without a kid, only an unambiguous single-key set is usable
            None => match (self.keyed.len(), self.unkeyed.len()) {
                (1, 0) => self.keyed.values().next().cloned(),
                (0, 1) => self.unkeyed.first().cloned(),
                _ => None,
            },
        }
    }
}

/// JWKS-backed RS256 identity token verifier.
pub struct JwksVerifier {
    client: reqwest::Client,
    jwks_uri: String,
    audience: String,
    issuers: Vec<String>,
    keys: RwLock<Option<KeyCache>>,
}

impl JwksVerifier {
    /// `audience` is the OAuth client id; `issuers` lists every accepted
    /// `iss` value.
    pub fn new(
        client: reqwest::Client,
        jwks_uri: impl Into<String>,
        audience: impl Into<String>,
        issuers: Vec<String>,
    ) -> Self {
        Self {
            client,
            jwks_uri: jwks_uri.into(),
            audience: audience.into(),
            issuers,
            keys: RwLock::new(None),
        }
    }

    /// Verify a raw identity token.
    pub async fn verify_id_token(&self, id_token: &str) -> Option<IdentityClaims> {
        match self.check(id_token).await {
            Ok(claims) => {
                debug!(sub = %claims.sub, iss = %claims.iss, "identity token verified");
                Some(claims)
            }
            Err(e) => {
                warn!(error = %e, "identity token rejected");
                None
            }
        }
    }

    async fn check(&self, id_token: &str) -> Result<IdentityClaims, VerifyError> {
        let header = decode_header(id_token)?;
        if header.alg != Algorithm::RS256 {
            return Err(VerifyError::UnsupportedAlgorithm(header.alg));
        }

        let key = self.key_for(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(self.issuers.as_slice());
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<IdentityClaims>(id_token, &key, &validation)?.claims;
        if claims.sub.trim().is_empty() {
            return Err(VerifyError::EmptySubject);
        }
        Ok(claims)
    }

    async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, VerifyError> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        // Expired cache, cold start, or key rotation
        self.refresh_keys().await?;

        self.cached_key(kid)
            .await
            .ok_or_else(|| VerifyError::UnknownKey(kid.map(str::to_owned)))
    }

    async fn cached_key(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        keys.as_ref()
            .filter(|cache| Instant::now() < cache.expires_at)
            .and_then(|cache| cache.lookup(kid))
    }

    async fn refresh_keys(&self) -> Result<(), VerifyError> {
        let response = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VerifyError::Keys(format!("fetching {}: {e}", self.jwks_uri)))?;

        let max_age = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_KEYS_MAX_AGE)
            .min(MAX_KEYS_MAX_AGE);

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| VerifyError::Keys(format!("parsing JWKS: {e}")))?;

        let mut keyed = HashMap::new();
        let mut unkeyed = Vec::new();
        for jwk in &set.keys {
            let key = match DecodingKey::from_jwk(jwk) {
                Ok(key) => key,
                Err(e) => {
                    debug!(kid = ?jwk.common.key_id, error = %e, "skipping unusable JWK");
                    continue;
                }
            };
            match jwk.common.key_id.as_deref() {
                Some(kid) if !kid.trim().is_empty() => {
                    keyed.insert(kid.to_owned(), key);
                }
                _ => unkeyed.push(key),
            }
        }

        if keyed.is_empty() && unkeyed.is_empty() {
            return Err(VerifyError::Keys("JWKS contains no usable keys".into()));
        }

        info!(
            keys = keyed.len() + unkeyed.len(),
            max_age_secs = max_age.as_secs(),
            "refreshed identity signing keys"
        );
        *self.keys.write().await = Some(KeyCache {
            keyed,
            unkeyed,
            expires_at: Instant::now()
                .checked_add(max_age)
                .unwrap_or_else(|| Instant::now() + DEFAULT_KEYS_MAX_AGE),
        });
        Ok(())
    }
}

impl IdentityVerifier for JwksVerifier {
    fn verify<'a>(&'a self, token: &'a TokenResponse) -> BoxFuture<'a, Option<IdentityClaims>> {
        Box::pin(self.verify_id_token(&token.id_token))
    }
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::routing::get;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const PRIVATE_KEY: &[u8] = include_bytes!("../tests/fixtures/test_rsa_private.pem");
    const JWKS: &str = include_str!("../tests/fixtures/jwks.json");
    const ISSUER: &str = "https://accounts.example";
    const CLIENT_ID: &str = "client-123";

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn sign(claims: serde_json::Value, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_owned);
        encode(
            &header,
            &claims,
            &EncodingKey::from_rsa_pem(PRIVATE_KEY).unwrap(),
        )
        .unwrap()
    }

    fn claims_for(sub: &str) -> serde_json::Value {
        serde_json::json!({
            "sub": sub,
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "iat": now(),
            "exp": now() + 600,
            "email": "user@example.com",
        })
    }

    /// Serve the fixture JWKS and count how often it is fetched.
    async fn start_jwks_server() -> (String, Arc<AtomicUsize>) {
        start_jwks_server_with("public, max-age=19000, must-revalidate").await
    }

    async fn start_jwks_server_with(cache_control: &'static str) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/certs",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        [
                            (header::CONTENT_TYPE, "application/json"),
                            (header::CACHE_CONTROL, cache_control),
                        ],
                        JWKS,
                    )
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/certs"), hits)
    }

    fn verifier(jwks_uri: &str) -> JwksVerifier {
        JwksVerifier::new(
            reqwest::Client::new(),
            jwks_uri,
            CLIENT_ID,
            vec![ISSUER.to_string()],
        )
    }

    #[tokio::test]
    async fn valid_token_yields_subject() {
        let (uri, _) = start_jwks_server().await;
        let token = sign(claims_for("user-42"), Some("test-key-1"));
        let claims = verifier(&uri).verify_id_token(&token).await.unwrap();
        assert_eq!(claims.subject(), "user-42");
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn keys_are_cached_across_calls() {
        let (uri, hits) = start_jwks_server().await;
        let v = verifier(&uri);
        let token = sign(claims_for("user-42"), Some("test-key-1"));
        assert!(v.verify_id_token(&token).await.is_some());
        assert!(v.verify_id_token(&token).await.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_max_age_is_clamped() {
        let (uri, hits) = start_jwks_server_with("max-age=18446744073709551615").await;
        let v = verifier(&uri);
        let token = sign(claims_for("user-42"), Some("test-key-1"));
        assert!(v.verify_id_token(&token).await.is_some());
        assert!(v.verify_id_token(&token).await.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let cached = v.keys.read().await;
        let expires_at = cached.as_ref().unwrap().expires_at;
        assert!(expires_at <= Instant::now() + MAX_KEYS_MAX_AGE);
    }

    #[tokio::test]
    async fn token_without_kid_uses_single_key() {
        let (uri, _) = start_jwks_server().await;
        let token = sign(claims_for("user-7"), None);
        assert!(verifier(&uri).verify_id_token(&token).await.is_some());
    }

    #[tokio::test]
    async fn unknown_kid_refetches_then_fails() {
        let (uri, hits) = start_jwks_server().await;
        let v = verifier(&uri);
        let good = sign(claims_for("user-42"), Some("test-key-1"));
        assert!(v.verify_id_token(&good).await.is_some());

        let rotated = sign(claims_for("user-42"), Some("rotated-key"));
        assert!(v.verify_id_token(&rotated).await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2, "unknown kid must trigger a refetch");
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let (uri, _) = start_jwks_server().await;
        let mut claims = claims_for("user-42");
        claims["aud"] = "someone-else".into();
        let token = sign(claims, Some("test-key-1"));
        assert!(verifier(&uri).verify_id_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn wrong_issuer_is_rejected() {
        let (uri, _) = start_jwks_server().await;
        let mut claims = claims_for("user-42");
        claims["iss"] = "https://evil.example".into();
        let token = sign(claims, Some("test-key-1"));
        assert!(verifier(&uri).verify_id_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (uri, _) = start_jwks_server().await;
        let mut claims = claims_for("user-42");
        claims["exp"] = (now() - 3600).into();
        let token = sign(claims, Some("test-key-1"));
        assert!(verifier(&uri).verify_id_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn empty_subject_is_rejected() {
        let (uri, _) = start_jwks_server().await;
        let token = sign(claims_for(""), Some("test-key-1"));
        assert!(verifier(&uri).verify_id_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let (uri, _) = start_jwks_server().await;
        let token = sign(claims_for("user-42"), Some("test-key-1"));
        let other = sign(claims_for("admin"), Some("test-key-1"));
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = other.split('.').nth(1).unwrap();
        let forged = parts.join(".");
        assert!(verifier(&uri).verify_id_token(&forged).await.is_none());
    }

    #[tokio::test]
    async fn hmac_token_is_rejected() {
        let (uri, _) = start_jwks_server().await;
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims_for("user-42"),
            &EncodingKey::from_secret(b"client-secret"),
        )
        .unwrap();
        assert!(verifier(&uri).verify_id_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn garbage_and_unreachable_keys_yield_none() {
        let v = verifier("http://127.0.0.1:1/certs");
        assert!(v.verify_id_token("not-a-jwt").await.is_none());
        let token = sign(claims_for("user-42"), Some("test-key-1"));
        assert!(v.verify_id_token(&token).await.is_none());
    }

    #[test]
    fn max_age_parsing() {
        assert_eq!(
            parse_max_age("public, max-age=19000, must-revalidate"),
            Some(Duration::from_secs(19000))
        );
        assert_eq!(parse_max_age("no-cache"), None);
        assert_eq!(parse_max_age("max-age=abc"), None);
    }
}
