//! Request-interception state machine
//!
//! `FlowEngine` drives a session through `NotStarted -> InFlight -> Done`:
//!
//! - `admit` decides whether a request may reach the protected handler or
//!   must be redirected to the provider.
//! - `complete_callback` finishes an in-flight flow from the provider's
//!   redirect.
//! - `recover` turns a classified revocation from a protected call into a
//!   forced-consent redirect.
//!
//! The engine holds no session state of its own. Every operation takes the
//! `SessionState` it mutates; persisting it is the caller's job.

use std::sync::Arc;

use common::Secret;
use tracing::{debug, info, instrument, warn};

use crate::authorize::{AuthorizationRequest, AuthorizationRequestBuilder};
use crate::credential::Credential;
use crate::error::{FlowError, Result};
use crate::identity::IdentityVerifier;
use crate::refresh_store::RefreshTokenStore;
use crate::revocation::{DownstreamError, ProtectedOutcome, is_revocation};
use crate::session::{FlowPhase, SessionState};
use crate::token::CodeExchange;
use crate::{pkce, redirect, state_token};

/// Supplies the callback URI registered with the provider.
pub trait RedirectUriProvider: Send + Sync {
    fn redirect_uri(&self) -> String;
}

impl RedirectUriProvider for String {
    fn redirect_uri(&self) -> String {
        self.clone()
    }
}

/// Supplies the scopes to request. `openid` is added regardless.
pub trait ScopeProvider: Send + Sync {
    fn scopes(&self) -> Vec<String>;
}

impl ScopeProvider for Vec<String> {
    fn scopes(&self) -> Vec<String> {
        self.clone()
    }
}

/// Behavior switches of the engine.
#[derive(Debug, Clone)]
pub struct FlowPolicy {
    /// Demote a done session after admitting it, so the next request
    /// runs the flow again
    pub reauthenticate_every_request: bool,
    /// Turn classified revocations into forced-consent redirects
    pub auto_handle_revocation: bool,
    pub use_pkce: bool,
    /// Request a refresh token (`access_type=offline`)
    pub offline_access: bool,
    /// Where to land after the callback when nothing was captured
    pub default_redirect: String,
}

impl Default for FlowPolicy {
    fn default() -> Self {
        Self {
            reauthenticate_every_request: true,
            auto_handle_revocation: true,
            use_pkce: true,
            offline_access: true,
            default_redirect: "/".to_owned(),
        }
    }
}

/// Collaborators injected into the engine.
pub struct FlowComponents {
    pub authorizer: AuthorizationRequestBuilder,
    pub redirect_uri: Arc<dyn RedirectUriProvider>,
    pub scopes: Arc<dyn ScopeProvider>,
    pub exchanger: Arc<dyn CodeExchange>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub refresh_store: Arc<dyn RefreshTokenStore>,
}

/// What the middleware should do with an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Run the protected handler
    Proceed,
    /// Short-circuit with a redirect to this authorization URL
    Redirect(String),
}

/// Query parameters the provider sends to the callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// Result of a successful callback.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub user_id: String,
    /// Captured original URL, or the policy default
    pub redirect_to: String,
}

/// Where a protected call ended up after revocation handling.
#[derive(Debug)]
pub enum Resolution<T> {
    Value(T),
    /// Forced-consent authorization URL
    Reauthorize(String),
}

pub struct FlowEngine {
    authorizer: AuthorizationRequestBuilder,
    redirect_uri: Arc<dyn RedirectUriProvider>,
    scopes: Arc<dyn ScopeProvider>,
    exchanger: Arc<dyn CodeExchange>,
    verifier: Arc<dyn IdentityVerifier>,
    refresh_store: Arc<dyn RefreshTokenStore>,
    policy: FlowPolicy,
}

impl FlowEngine {
    pub fn new(components: FlowComponents, policy: FlowPolicy) -> Self {
        Self {
            authorizer: components.authorizer,
            redirect_uri: components.redirect_uri,
            scopes: components.scopes,
            exchanger: components.exchanger,
            verifier: components.verifier,
            refresh_store: components.refresh_store,
            policy,
        }
    }

    pub fn policy(&self) -> &FlowPolicy {
        &self.policy
    }

    /// Gate one inbound request.
    ///
    /// A done session is admitted. With `reauthenticate_every_request` the
    /// done flag is dropped on the way through, which only affects the
    /// next request. Anything else starts a new flow.
    pub fn admit(&self, session: &mut SessionState, current_url: &str) -> Admission {
        match session.phase() {
            FlowPhase::Done => {
                if self.policy.reauthenticate_every_request {
                    debug!("admitting request, next one re-authenticates");
                    session.oauth_done = false;
                }
                Admission::Proceed
            }
            FlowPhase::NotStarted | FlowPhase::InFlight => {
                Admission::Redirect(self.start_authorization(session, current_url, false))
            }
        }
    }

    /// Put the session in flight and return the authorization URL.
    ///
    /// Any earlier pending state token is replaced. The captured redirect
    /// is kept if one exists.
    pub fn start_authorization(
        &self,
        session: &mut SessionState,
        current_url: &str,
        force_approval_prompt: bool,
    ) -> String {
        redirect::capture_if_absent(session, current_url);
        session.oauth_done = false;

        let state = state_token::issue_and_store(session);
        let challenge = if self.policy.use_pkce {
            Some(pkce::issue_and_store(session))
        } else {
            session.pkce_verifier = None;
            None
        };

        let redirect_uri = self.redirect_uri.redirect_uri();
        let scopes = self.scopes.scopes();
        let url = self.authorizer.build_request(&AuthorizationRequest {
            redirect_uri: &redirect_uri,
            state_token: &state,
            scopes: &scopes,
            offline_access: self.policy.offline_access,
            force_approval_prompt,
            code_challenge: challenge.as_deref(),
        });

        info!(
            force_approval_prompt,
            pkce = self.policy.use_pkce,
            "redirecting to authorization endpoint"
        );
        url
    }

    /// Finish an in-flight flow from the provider's callback.
    ///
    /// Every failure is terminal for the request. The pending state token
    /// and PKCE verifier are consumed as soon as both parameters are present,
    /// so a replayed callback fails with `StateTokenMismatch`.
    #[instrument(skip_all)]
    pub async fn complete_callback(
        &self,
        session: &mut SessionState,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome> {
        let (code, state) = match (params.code.as_deref(), params.state.as_deref()) {
            (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => (code, state),
            _ => {
                warn!(
                    has_code = params.code.is_some(),
                    has_state = params.state.is_some(),
                    "callback missing parameters"
                );
                return Err(FlowError::MissingCallbackParameters);
            }
        };

        let verifier = session.pkce_verifier.take();
        if !state_token::validate_and_consume(session, state) {
            return Err(FlowError::StateTokenMismatch);
        }

        let redirect_uri = self.redirect_uri.redirect_uri();
        let tokens = self
            .exchanger
            .exchange(code, &redirect_uri, verifier.as_ref().map(|v| v.expose_str()))
            .await
            .inspect_err(|e| {
                if e.is_invalid_grant() {
                    warn!(error = %e, "authorization code already redeemed or expired");
                } else {
                    warn!(error = %e, "authorization code exchange failed");
                }
            })?;

        let claims = self
            .verifier
            .verify(&tokens)
            .await
            .ok_or(FlowError::IdentityVerificationFailure)?;
        let user_id = claims.subject().to_owned();

        if let Some(refresh_token) = tokens.refresh_token.as_deref() {
            if let Err(e) = self.refresh_store.save(&user_id, refresh_token).await {
                warn!(user_id = %user_id, error = %e, "failed to persist refresh token");
            }
        }

        let mut credential = self
            .credential_for(&user_id, tokens.access_token.clone(), tokens.expires_in)
            .await;
        if credential.refresh_token.is_none() {
            credential.refresh_token = tokens.refresh_token.clone().map(Secret::from);
        }

        session.user_id = Some(user_id.clone());
        session.id_token = Some(claims);
        session.credential = Some(credential);
        session.oauth_done = true;

        let redirect_to = redirect::consume(session, &self.policy.default_redirect);
        info!(user_id = %user_id, redirect_to = %redirect_to, "authorization flow completed");
        Ok(CallbackOutcome {
            user_id,
            redirect_to,
        })
    }

    /// Build a credential for `user_id`, pairing the access token with
    /// whatever refresh token the store holds.
    pub async fn credential_for(
        &self,
        user_id: &str,
        access_token: String,
        expires_in: Option<u64>,
    ) -> Credential {
        let refresh_token = self.refresh_store.load(user_id).await;
        if refresh_token.is_none() {
            debug!(user_id, "no refresh token stored, credential cannot renew");
        }
        Credential::new(access_token, refresh_token, expires_in)
    }

    /// Trade the credential's refresh token for a fresh access token.
    ///
    /// Returns `Ok(None)` when there is nothing to renew with. A rotated
    /// refresh token is saved for `user_id`; otherwise the old one is kept.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn renew(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> std::result::Result<Option<Credential>, DownstreamError> {
        let Some(refresh_token) = credential.refresh_token.as_ref() else {
            return Ok(None);
        };

        let response = self
            .exchanger
            .refresh(refresh_token.expose_str())
            .await
            .inspect_err(|e| {
                if e.is_invalid_grant() {
                    warn!(user_id, "refresh token rejected by provider");
                }
            })
            .map_err(DownstreamError::from)?;

        let refresh_token = match response.refresh_token {
            Some(rotated) => {
                if let Err(e) = self.refresh_store.save(user_id, &rotated).await {
                    warn!(user_id, error = %e, "failed to persist rotated refresh token");
                }
                Secret::from(rotated)
            }
            None => refresh_token.clone(),
        };

        debug!(user_id, "access token renewed");
        Ok(Some(Credential::new(
            response.access_token,
            Some(refresh_token),
            response.expires_in,
        )))
    }

    /// Handle a failed protected call.
    ///
    /// A revocation with `auto_handle_revocation` on restarts the flow with
    /// forced consent and yields the redirect. Everything else comes back
    /// as an error for the caller to propagate.
    pub fn recover(
        &self,
        session: &mut SessionState,
        failure: &DownstreamError,
        current_url: &str,
    ) -> Result<String> {
        if !is_revocation(failure) {
            return Err(FlowError::UnclassifiedDownstreamFailure(failure.clone()));
        }
        if !self.policy.auto_handle_revocation {
            warn!(error = %failure, "revocation detected, automatic handling disabled");
            return Err(FlowError::RevocationDetected(failure.clone()));
        }

        warn!(error = %failure, "revocation detected, forcing re-consent");
        session.credential = None;
        Ok(self.start_authorization(session, current_url, true))
    }

    /// Branch on a classified protected-call outcome.
    pub fn resolve<T>(
        &self,
        session: &mut SessionState,
        outcome: ProtectedOutcome<T>,
        current_url: &str,
    ) -> Result<Resolution<T>> {
        match outcome {
            ProtectedOutcome::Ok(value) => Ok(Resolution::Value(value)),
            ProtectedOutcome::RevocationDetected(err) | ProtectedOutcome::OtherFailure(err) => self
                .recover(session, &err, current_url)
                .map(Resolution::Reauthorize),
        }
    }

    /// Forget the completed flow so the next request starts over.
    ///
    /// Stored refresh tokens are untouched.
    pub fn clear(&self, session: &mut SessionState) {
        session.oauth_done = false;
        session.user_id = None;
        session.id_token = None;
        session.credential = None;
        debug!("cleared oauth state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::identity::IdentityClaims;
    use crate::refresh_store::InMemoryRefreshTokenStore;
    use crate::token::{ExchangeError, RefreshResponse, TokenResponse};
    use std::sync::Mutex;
    use url::Url;

    const REDIRECT_URI: &str = "https://app.example.com/oauth2callback";

    #[derive(Default)]
    struct StubExchange {
        refresh_token: Option<String>,
        fail_with: Option<ExchangeError>,
        refresh_fails_with: Option<ExchangeError>,
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl CodeExchange for StubExchange {
        fn exchange<'a>(
            &'a self,
            code: &'a str,
            _redirect_uri: &'a str,
            code_verifier: Option<&'a str>,
        ) -> BoxFuture<'a, std::result::Result<TokenResponse, ExchangeError>> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .unwrap()
                    .push((code.to_owned(), code_verifier.map(str::to_owned)));
                if let Some(err) = &self.fail_with {
                    return Err(err.clone());
                }
                Ok(TokenResponse {
                    access_token: "at-1".into(),
                    refresh_token: self.refresh_token.clone(),
                    id_token: "header.claims.sig".into(),
                    expires_in: Some(3600),
                })
            })
        }

        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> BoxFuture<'a, std::result::Result<RefreshResponse, ExchangeError>> {
            Box::pin(async move {
                if let Some(err) = &self.refresh_fails_with {
                    return Err(err.clone());
                }
                Ok(RefreshResponse {
                    access_token: "at-2".into(),
                    refresh_token: None,
                    expires_in: Some(3600),
                })
            })
        }
    }

    struct StubVerifier {
        subject: Option<&'static str>,
    }

    impl IdentityVerifier for StubVerifier {
        fn verify<'a>(
            &'a self,
            _token: &'a TokenResponse,
        ) -> BoxFuture<'a, Option<IdentityClaims>> {
            Box::pin(async move {
                self.subject.map(|sub| IdentityClaims {
                    sub: sub.to_owned(),
                    iss: "https://accounts.google.com".into(),
                    exp: u64::MAX,
                    email: None,
                    email_verified: None,
                })
            })
        }
    }

    struct Harness {
        engine: FlowEngine,
        exchange: Arc<StubExchange>,
        store: Arc<InMemoryRefreshTokenStore>,
    }

    fn harness(exchange: StubExchange, subject: Option<&'static str>, policy: FlowPolicy) -> Harness {
        let exchange = Arc::new(exchange);
        let store = Arc::new(InMemoryRefreshTokenStore::new());
        let engine = FlowEngine::new(
            FlowComponents {
                authorizer: AuthorizationRequestBuilder::new(
                    "https://accounts.google.com/o/oauth2/auth",
                    "client-123",
                )
                .unwrap(),
                redirect_uri: Arc::new(REDIRECT_URI.to_owned()),
                scopes: Arc::new(vec!["email".to_owned()]),
                exchanger: exchange.clone(),
                verifier: Arc::new(StubVerifier { subject }),
                refresh_store: store.clone(),
            },
            policy,
        );
        Harness {
            engine,
            exchange,
            store,
        }
    }

    fn default_harness() -> Harness {
        harness(
            StubExchange {
                refresh_token: Some("R1".into()),
                ..Default::default()
            },
            Some("user-42"),
            FlowPolicy::default(),
        )
    }

    fn query(url: &str, key: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn redirect_target(admission: Admission) -> String {
        match admission {
            Admission::Redirect(url) => url,
            Admission::Proceed => panic!("expected a redirect"),
        }
    }

    #[test]
    fn fresh_session_is_redirected_with_state_and_openid_scope() {
        let h = default_harness();
        let mut session = SessionState::default();

        let url = redirect_target(h.engine.admit(&mut session, "https://app.example.com/reports"));

        let state = query(&url, "state").unwrap();
        assert!(state.len() >= 32);
        assert_eq!(session.state_token.as_deref(), Some(state.as_str()));
        assert_eq!(session.phase(), FlowPhase::InFlight);
        assert!(query(&url, "scope").unwrap().split(' ').any(|s| s == "openid"));
        assert_eq!(query(&url, "access_type").as_deref(), Some("offline"));
        assert_eq!(query(&url, "approval_prompt"), None);
        assert_eq!(
            session.redirect_after_auth.as_deref(),
            Some("https://app.example.com/reports")
        );
    }

    #[test]
    fn pkce_challenge_matches_stored_verifier() {
        let h = default_harness();
        let mut session = SessionState::default();

        let url = redirect_target(h.engine.admit(&mut session, "https://app.example.com/"));

        let verifier = session.pkce_verifier.as_ref().unwrap();
        assert_eq!(
            query(&url, "code_challenge"),
            Some(pkce::compute_challenge(verifier.expose_str()))
        );
        assert_eq!(query(&url, "code_challenge_method").as_deref(), Some("S256"));
    }

    #[test]
    fn pkce_disabled_sends_no_challenge() {
        let policy = FlowPolicy {
            use_pkce: false,
            ..Default::default()
        };
        let h = harness(StubExchange::default(), Some("u"), policy);
        let mut session = SessionState::default();

        let url = redirect_target(h.engine.admit(&mut session, "https://app.example.com/"));

        assert_eq!(query(&url, "code_challenge"), None);
        assert!(session.pkce_verifier.is_none());
    }

    #[test]
    fn restarted_flow_keeps_first_captured_url() {
        let h = default_harness();
        let mut session = SessionState::default();

        let first = redirect_target(h.engine.admit(&mut session, "https://app.example.com/a"));
        let second = redirect_target(h.engine.admit(&mut session, "https://app.example.com/b"));

        assert_ne!(query(&first, "state"), query(&second, "state"));
        assert_eq!(
            session.redirect_after_auth.as_deref(),
            Some("https://app.example.com/a")
        );
    }

    #[tokio::test]
    async fn callback_completes_flow_and_redirects_to_captured_url() {
        let h = default_harness();
        let mut session = SessionState::default();
        let url = redirect_target(h.engine.admit(&mut session, "https://app.example.com/reports"));
        let verifier = session.pkce_verifier.as_ref().unwrap().expose_str().to_owned();

        let outcome = h
            .engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("abc".into()),
                    state: query(&url, "state"),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.user_id, "user-42");
        assert_eq!(outcome.redirect_to, "https://app.example.com/reports");
        assert_eq!(session.phase(), FlowPhase::Done);
        assert_eq!(session.user_id.as_deref(), Some("user-42"));
        assert!(session.state_token.is_none());
        assert!(session.pkce_verifier.is_none());
        assert!(session.redirect_after_auth.is_none());

        let credential = session.credential.as_ref().unwrap();
        assert_eq!(credential.bearer(), "at-1");
        assert_eq!(credential.refresh_token.as_ref().unwrap().expose_str(), "R1");
        assert_eq!(h.store.load("user-42").await.unwrap().expose_str(), "R1");

        let seen = h.exchange.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("abc".to_owned(), Some(verifier))]);
    }

    #[tokio::test]
    async fn callback_without_capture_lands_on_default() {
        let h = default_harness();
        let mut session = SessionState::default();
        let state = state_token::issue_and_store(&mut session);

        let outcome = h
            .engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("abc".into()),
                    state: Some(state),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.redirect_to, "/");
    }

    #[tokio::test]
    async fn exchange_without_refresh_token_keeps_stored_one() {
        let h = harness(StubExchange::default(), Some("user-42"), FlowPolicy::default());
        h.store.save("user-42", "R1").await.unwrap();
        let mut session = SessionState::default();
        let state = state_token::issue_and_store(&mut session);

        h.engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("abc".into()),
                    state: Some(state),
                },
            )
            .await
            .unwrap();

        assert_eq!(h.store.load("user-42").await.unwrap().expose_str(), "R1");
        let credential = session.credential.unwrap();
        assert_eq!(credential.refresh_token.unwrap().expose_str(), "R1");
    }

    #[tokio::test]
    async fn unknown_user_without_refresh_token_gets_non_renewable_credential() {
        let h = harness(StubExchange::default(), Some("user-7"), FlowPolicy::default());
        let mut session = SessionState::default();
        let state = state_token::issue_and_store(&mut session);

        h.engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("abc".into()),
                    state: Some(state),
                },
            )
            .await
            .unwrap();

        let credential = session.credential.unwrap();
        assert!(!credential.can_renew());
        assert!(h.engine.renew("user-7", &credential).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_state_is_rejected_and_clears_pending_token() {
        let h = default_harness();
        let mut session = SessionState {
            state_token: Some("right".into()),
            ..Default::default()
        };

        let err = h
            .engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("abc".into()),
                    state: Some("wrong".into()),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::StateTokenMismatch));
        assert_eq!(err.status_code(), 403);
        assert!(session.state_token.is_none());
        assert!(session.user_id.is_none());
        assert!(!session.oauth_done);
        assert!(h.exchange.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_callback_fails() {
        let h = default_harness();
        let mut session = SessionState::default();
        let state = state_token::issue_and_store(&mut session);
        let params = CallbackParams {
            code: Some("abc".into()),
            state: Some(state),
        };

        h.engine.complete_callback(&mut session, &params).await.unwrap();
        let err = h
            .engine
            .complete_callback(&mut session, &params)
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::StateTokenMismatch));
    }

    #[tokio::test]
    async fn missing_parameters_are_rejected() {
        let h = default_harness();
        let mut session = SessionState::default();
        state_token::issue_and_store(&mut session);

        for params in [
            CallbackParams {
                code: Some("abc".into()),
                state: None,
            },
            CallbackParams {
                code: None,
                state: Some("tok".into()),
            },
            CallbackParams::default(),
        ] {
            let err = h
                .engine
                .complete_callback(&mut session, &params)
                .await
                .unwrap_err();
            assert!(matches!(err, FlowError::MissingCallbackParameters));
            assert_eq!(err.status_code(), 403);
        }
    }

    #[tokio::test]
    async fn failed_exchange_is_terminal() {
        let exchange = StubExchange {
            fail_with: Some(ExchangeError::Provider {
                status: 400,
                error: "invalid_grant".into(),
                body: r#"{"error":"invalid_grant"}"#.into(),
            }),
            ..Default::default()
        };
        let h = harness(exchange, Some("user-42"), FlowPolicy::default());
        let mut session = SessionState::default();
        let state = state_token::issue_and_store(&mut session);

        let err = h
            .engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("used".into()),
                    state: Some(state),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::TokenExchangeFailure(_)));
        assert_eq!(err.status_code(), 403);
        assert!(!session.oauth_done);
        assert!(session.state_token.is_none());
    }

    #[tokio::test]
    async fn unverifiable_identity_is_a_flow_error() {
        let h = harness(StubExchange::default(), None, FlowPolicy::default());
        let mut session = SessionState::default();
        let state = state_token::issue_and_store(&mut session);

        let err = h
            .engine
            .complete_callback(
                &mut session,
                &CallbackParams {
                    code: Some("abc".into()),
                    state: Some(state),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::IdentityVerificationFailure));
        assert_eq!(err.status_code(), 500);
        assert!(session.user_id.is_none());
        assert!(!session.oauth_done);
    }

    #[test]
    fn done_session_proceeds_and_demotes_for_next_request() {
        let h = default_harness();
        let mut session = SessionState {
            oauth_done: true,
            ..Default::default()
        };

        assert_eq!(h.engine.admit(&mut session, "https://app.example.com/"), Admission::Proceed);
        assert!(!session.oauth_done);
        assert!(matches!(
            h.engine.admit(&mut session, "https://app.example.com/"),
            Admission::Redirect(_)
        ));
    }

    #[test]
    fn done_session_stays_done_without_reauthentication_policy() {
        let policy = FlowPolicy {
            reauthenticate_every_request: false,
            ..Default::default()
        };
        let h = harness(StubExchange::default(), Some("u"), policy);
        let mut session = SessionState {
            oauth_done: true,
            ..Default::default()
        };

        for _ in 0..3 {
            assert_eq!(h.engine.admit(&mut session, "https://app.example.com/"), Admission::Proceed);
        }
        assert!(session.oauth_done);
    }

    #[test]
    fn revocation_forces_reconsent_redirect() {
        let h = default_harness();
        let mut session = SessionState {
            oauth_done: true,
            user_id: Some("user-42".into()),
            credential: Some(Credential::new("at", None, None)),
            ..Default::default()
        };
        let outcome: ProtectedOutcome<()> = ProtectedOutcome::classify(Err(
            DownstreamError::Resource {
                status: 401,
                body: r#"{"error":{"message":"Invalid Credentials"}}"#.into(),
            },
        ));

        let resolution = h
            .engine
            .resolve(&mut session, outcome, "https://app.example.com/me")
            .unwrap();

        let Resolution::Reauthorize(url) = resolution else {
            panic!("expected a forced re-consent redirect");
        };
        assert_eq!(query(&url, "approval_prompt").as_deref(), Some("force"));
        assert_eq!(session.phase(), FlowPhase::InFlight);
        assert!(session.credential.is_none());
        assert_eq!(
            session.redirect_after_auth.as_deref(),
            Some("https://app.example.com/me")
        );
    }

    #[test]
    fn revocation_is_propagated_when_auto_handling_is_off() {
        let policy = FlowPolicy {
            auto_handle_revocation: false,
            ..Default::default()
        };
        let h = harness(StubExchange::default(), Some("u"), policy);
        let mut session = SessionState::default();
        let failure = DownstreamError::TokenEndpoint {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.into(),
        };

        let err = h
            .engine
            .recover(&mut session, &failure, "https://app.example.com/")
            .unwrap_err();

        assert!(matches!(err, FlowError::RevocationDetected(_)));
        assert!(session.state_token.is_none());
    }

    #[test]
    fn unrelated_failure_passes_through() {
        let h = default_harness();
        let mut session = SessionState::default();
        let outcome: ProtectedOutcome<()> =
            ProtectedOutcome::classify(Err(DownstreamError::Transport("connection reset".into())));

        let err = h
            .engine
            .resolve(&mut session, outcome, "https://app.example.com/")
            .unwrap_err();

        assert!(matches!(err, FlowError::UnclassifiedDownstreamFailure(_)));
        assert_eq!(err.status_code(), 502);
        assert!(session.state_token.is_none());
    }

    #[test]
    fn successful_outcome_is_returned() {
        let h = default_harness();
        let mut session = SessionState::default();

        let resolution = h
            .engine
            .resolve(&mut session, ProtectedOutcome::Ok(7), "https://app.example.com/")
            .unwrap();

        assert!(matches!(resolution, Resolution::Value(7)));
    }

    #[tokio::test]
    async fn renew_keeps_refresh_token_when_not_rotated() {
        let h = default_harness();
        let credential = Credential::new("at-1", Some(Secret::from("R1")), Some(10));

        let renewed = h.engine.renew("user-42", &credential).await.unwrap().unwrap();

        assert_eq!(renewed.bearer(), "at-2");
        assert_eq!(renewed.refresh_token.unwrap().expose_str(), "R1");
    }

    #[tokio::test]
    async fn revoked_refresh_token_classifies_as_revocation() {
        let exchange = StubExchange {
            refresh_fails_with: Some(ExchangeError::Provider {
                status: 400,
                error: "invalid_grant".into(),
                body: r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#.into(),
            }),
            ..Default::default()
        };
        let h = harness(exchange, Some("user-42"), FlowPolicy::default());
        let credential = Credential::new("at-1", Some(Secret::from("R1")), None);

        let err = h.engine.renew("user-42", &credential).await.unwrap_err();

        assert!(is_revocation(&err));
    }

    #[test]
    fn clear_forgets_identity_but_not_refresh_tokens() {
        let h = default_harness();
        let mut session = SessionState {
            oauth_done: true,
            user_id: Some("user-42".into()),
            credential: Some(Credential::new("at", None, None)),
            ..Default::default()
        };

        h.engine.clear(&mut session);

        assert_eq!(session.phase(), FlowPhase::NotStarted);
        assert!(session.user_id.is_none());
        assert!(session.credential.is_none());
    }
}
