//! Credential handed to protected handlers

use common::Secret;

/// Seconds before expiry at which an access token is treated as stale
const EXPIRY_SKEW_SECS: u64 = 60;

/// Access token plus (when known) the refresh token that can renew it.
///
/// `refresh_token` is `None` when the provider never issued one for this
/// user, or it was lost; such a credential works until the access token
/// expires and then needs a new consent.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    /// Absolute expiry, unix seconds
    pub expires_at: Option<u64>,
}

impl Credential {
    /// `expires_in` is the token endpoint's delta in seconds.
    pub fn new(
        access_token: impl Into<Secret<String>>,
        refresh_token: Option<Secret<String>>,
        expires_in: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: expires_in.map(|delta| now_secs().saturating_add(delta)),
        }
    }

    pub fn bearer(&self) -> &str {
        self.access_token.expose_str()
    }

    pub fn can_renew(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Expired, or about to within the skew window. Unknown expiry counts
    /// as fresh; the resource server will tell us otherwise.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| now_secs().saturating_add(EXPIRY_SKEW_SECS) >= at)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
