//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Issued next to the state token when the engine runs with PKCE enabled.
//! The verifier stays in the session; only its S256 challenge travels in the
//! authorization URL. The verifier is taken out of the session on exchange,
//! so it is one-time like the state token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::session::SessionState;

/// Generate a code verifier: 64 random bytes, 86 base64url characters,
/// inside RFC 7636's 43..=128 character window.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Store a new verifier in the session and return its challenge.
pub fn issue_and_store(session: &mut SessionState) -> String {
    let verifier = generate_verifier();
    let challenge = compute_challenge(&verifier);
    session.pkce_verifier = Some(Secret::new(verifier));
    challenge
}
