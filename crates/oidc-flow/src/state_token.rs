//! One-time CSRF state tokens
//!
//! A token is minted when the flow starts, stored as the session's pending
//! token, round-tripped through the provider as the `state` parameter, and
//! consumed by the callback. Consumption always clears the pending token, so
//! replaying the same callback URL fails after the first attempt.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use tracing::{debug, warn};

use crate::constants::STATE_TOKEN_BYTES;
use crate::session::SessionState;

/// Generate a fresh state token from the thread-local CSPRNG.
///
/// 32 random bytes encoded as URL-safe base64 without padding: 43 characters,
/// safe to embed in a query string without escaping.
pub fn generate() -> String {
    let mut bytes = [0u8; STATE_TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Mint a token and make it the session's only pending token.
pub fn issue_and_store(session: &mut SessionState) -> String {
    let token = generate();
    if session.state_token.is_some() {
        debug!("replacing pending state token");
    }
    session.state_token = Some(token.clone());
    token
}

/// Check `presented` against the pending token and clear it either way.
///
/// Returns false when no token is pending. A false result is terminal for
/// the callback: the caller must not retry.
pub fn validate_and_consume(session: &mut SessionState, presented: &str) -> bool {
    match session.state_token.take() {
        Some(expected) if constant_time_eq(expected.as_bytes(), presented.as_bytes()) => true,
        Some(_) => {
            warn!("state token mismatch");
            false
        }
        None => {
            warn!("no state token pending for this session");
            false
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
