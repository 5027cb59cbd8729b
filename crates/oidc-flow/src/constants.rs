//! Provider defaults and protocol constants
//!
//! Endpoint defaults target Google's OpenID Connect deployment. All of them
//! can be overridden in the gate's `[provider]` config table.

/// Authorization endpoint the browser is redirected to
pub const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/auth";

/// Token endpoint for code exchange and refresh
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Published signing keys for identity tokens
pub const DEFAULT_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Userinfo endpoint, used by the gate's sample protected resource
pub const DEFAULT_USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Issuer values Google puts in `iss` (both forms appear in the wild)
pub const DEFAULT_ISSUERS: &[&str] = &["https://accounts.google.com", "accounts.google.com"];

/// Scope that is always requested, regardless of configuration
pub const OPENID_SCOPE: &str = "openid";

/// Raw bytes of randomness behind a state token (256 bits, 43 chars encoded)
pub const STATE_TOKEN_BYTES: usize = 32;

/// Provider error code for a redeemed, expired, or revoked grant
pub const INVALID_GRANT: &str = "invalid_grant";

/// Resource-server message for a revoked or expired access token
pub const INVALID_CREDENTIALS: &str = "Invalid Credentials";
