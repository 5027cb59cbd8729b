//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from the OAUTH_CLIENT_SECRET env var or
//! `client_secret_file`, never stored in the TOML directly.

use common::Secret;
use oidc_flow::constants::{
    DEFAULT_AUTHORIZATION_ENDPOINT, DEFAULT_ISSUERS, DEFAULT_JWKS_URI, DEFAULT_TOKEN_ENDPOINT,
    DEFAULT_USERINFO_ENDPOINT,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// Env var that overrides `client_secret_file`
pub const CLIENT_SECRET_ENV: &str = "OAUTH_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Name of the cookie carrying the session id
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    /// Sessions idle for longer than this are forgotten
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
}

/// OAuth client registration and flow policy
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Raw secret, or the client-secrets JSON downloaded from the provider
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    /// Absolute callback URL registered with the provider
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Rebuild captured URLs with https (TLS terminated in front of us)
    #[serde(default)]
    pub force_https: bool,
    #[serde(default = "default_true")]
    pub reauthenticate_every_request: bool,
    #[serde(default = "default_true")]
    pub auto_handle_revocation: bool,
    #[serde(default = "default_true")]
    pub use_pkce: bool,
    #[serde(default = "default_redirect")]
    pub default_redirect: String,
}

/// Identity provider endpoints, Google by default
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub userinfo_endpoint: String,
    pub issuers: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            authorization_endpoint: DEFAULT_AUTHORIZATION_ENDPOINT.to_owned(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_owned(),
            jwks_uri: DEFAULT_JWKS_URI.to_owned(),
            userinfo_endpoint: DEFAULT_USERINFO_ENDPOINT.to_owned(),
            issuers: DEFAULT_ISSUERS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// Refresh token persistence
#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// JSON file for refresh tokens; in-memory when unset
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
}

/// Client-secrets document as downloaded from the provider console
#[derive(Deserialize)]
struct ClientSecretsFile {
    #[serde(default)]
    web: Option<ClientSecretEntry>,
    #[serde(default)]
    installed: Option<ClientSecretEntry>,
}

#[derive(Deserialize)]
struct ClientSecretEntry {
    client_secret: String,
}

fn default_max_connections() -> usize {
    1000
}

fn default_session_cookie() -> String {
    "oidc_gate_session".to_owned()
}

fn default_session_idle_timeout_secs() -> u64 {
    oidc_flow::session::DEFAULT_SESSION_IDLE_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_redirect() -> String {
    "/".to_owned()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let raw = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            config.oauth.client_secret = parse_client_secret(&raw)?;
        }

        if config.oauth.client_secret.is_none() {
            return Err(common::Error::Config(format!(
                "no client secret: set {CLIENT_SECRET_ENV} or oauth.client_secret_file"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.server.session_cookie.trim().is_empty() {
            return Err(common::Error::Config(
                "session_cookie must not be empty".into(),
            ));
        }
        if self.server.session_idle_timeout_secs == 0 {
            return Err(common::Error::Config(
                "session_idle_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        let redirect = Url::parse(&self.oauth.redirect_uri)?;
        if !matches!(redirect.scheme(), "http" | "https") {
            return Err(common::Error::Config(format!(
                "redirect_uri must be an http(s) URL, got: {}",
                self.oauth.redirect_uri
            )));
        }

        for endpoint in [
            &self.provider.authorization_endpoint,
            &self.provider.token_endpoint,
            &self.provider.jwks_uri,
            &self.provider.userinfo_endpoint,
        ] {
            Url::parse(endpoint)?;
        }
        if self.provider.issuers.is_empty() {
            return Err(common::Error::Config(
                "provider.issuers must list at least one issuer".into(),
            ));
        }

        Ok(())
    }

    /// Path component of `redirect_uri`; the gate mounts its callback there.
    pub fn callback_path(&self) -> String {
        Url::parse(&self.oauth.redirect_uri)
            .map(|url| url.path().to_owned())
            .unwrap_or_else(|_| "/oauth2callback".to_owned())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oidc-gate.toml")
    }
}

/// Accept either a bare secret or a `{"web": {...}}` / `{"installed": {...}}`
/// client-secrets document. Blank content yields `None`.
fn parse_client_secret(raw: &str) -> common::Result<Option<Secret<String>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if !raw.starts_with('{') {
        return Ok(Some(Secret::new(raw.to_owned())));
    }

    let file: ClientSecretsFile = serde_json::from_str(raw)?;
    let entry = file.web.or(file.installed).ok_or_else(|| {
        common::Error::Config(
            "client secrets JSON has neither a \"web\" nor an \"installed\" section".into(),
        )
    })?;
    Ok(Some(Secret::new(entry.client_secret)))
}
