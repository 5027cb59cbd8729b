//! Authorization endpoint URL construction
//!
//! Builds the browser redirect that starts the Authorization Code flow.
//! Output is deterministic for a given input: same parameters in the same
//! order, so tests and logs can compare URLs verbatim.

use url::Url;

use crate::constants::OPENID_SCOPE;

/// Parameters of one authorization redirect.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub redirect_uri: &'a str,
    pub state_token: &'a str,
    pub scopes: &'a [String],
    /// Ask for a refresh token (`access_type=offline`)
    pub offline_access: bool,
    /// Force the consent screen so a refresh token is issued again
    pub force_approval_prompt: bool,
    /// S256 PKCE challenge, when PKCE is enabled
    pub code_challenge: Option<&'a str>,
}

/// Builds provider authorization URLs for one client.
#[derive(Debug, Clone)]
pub struct AuthorizationRequestBuilder {
    endpoint: Url,
    client_id: String,
}

impl AuthorizationRequestBuilder {
    pub fn new(endpoint: &str, client_id: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            client_id: client_id.into(),
        })
    }

    /// Build an authorization URL without PKCE.
    pub fn build(
        &self,
        redirect_uri: &str,
        state_token: &str,
        scopes: &[String],
        offline_access: bool,
        force_approval_prompt: bool,
    ) -> String {
        self.build_request(&AuthorizationRequest {
            redirect_uri,
            state_token,
            scopes,
            offline_access,
            force_approval_prompt,
            code_challenge: None,
        })
    }

    /// Build an authorization URL from a full request description.
    ///
    /// `openid` is always the first requested scope, whether or not the
    /// caller listed it.
    pub fn build_request(&self, request: &AuthorizationRequest<'_>) -> String {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", request.redirect_uri)
                .append_pair("scope", &normalize_scopes(request.scopes).join(" "))
                .append_pair("state", request.state_token);
            if request.offline_access {
                query.append_pair("access_type", "offline");
            }
            if request.force_approval_prompt {
                query.append_pair("approval_prompt", "force");
            }
            if let Some(challenge) = request.code_challenge {
                query
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", "S256");
            }
        }
        url.into()
    }
}

/// `openid` first, then the configured scopes in order, duplicates and
/// blanks removed.
pub fn normalize_scopes(configured: &[String]) -> Vec<String> {
    let mut scopes = vec![OPENID_SCOPE.to_owned()];
    for scope in configured {
        let scope = scope.trim();
        if !scope.is_empty() && !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_owned());
        }
    }
    scopes
}
