//! PKCE (Proof Key for Code Exchange) per RFC 7636, plus the `state` nonce
//!
//! The verifier stays server-side with the pending exchange and is sent
//! during token exchange; the S256 challenge goes into the authorization URL
//! so the provider can tie the code to whoever started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

/// Random PKCE code verifier.
///
/// 64 random bytes as URL-safe base64 without padding: 86 characters,
/// inside the 43-128 range RFC 7636 allows.
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

/// Random CSRF `state` value, 32 bytes of entropy.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
