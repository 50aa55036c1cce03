//! Opaque credential generation, hashing and PKCE.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix of issued access tokens (greppable by secret scanners)
pub const ACCESS_TOKEN_PREFIX: &str = "mcpk_at_";
/// Prefix of issued refresh tokens
pub const REFRESH_TOKEN_PREFIX: &str = "mcpk_rt_";
/// Prefix of authorization codes
pub const CODE_PREFIX: &str = "mcpk_ac_";

/// The only PKCE method accepted
pub const PKCE_METHOD_S256: &str = "S256";

/// `<prefix><43-char URL-safe base64>` carrying 256 bits of entropy.
#[must_use]
pub fn generate_opaque(prefix: &str) -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(random_bytes))
}

/// Random `state` / nonce value
#[must_use]
pub fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Client secret handed out once at registration
#[must_use]
pub fn generate_client_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Storage key for a credential: hex SHA-256, so the store never holds the value itself.
#[must_use]
pub fn hash_secret(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Constant-time comparison of a presented secret against a stored hash.
#[must_use]
pub fn secret_matches(presented: &str, stored_hash: &str) -> bool {
    hash_secret(presented).as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Generate a PKCE `(verifier, challenge)` pair (S256)
#[must_use]
pub fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
    let challenge = s256_challenge(&verifier);
    (verifier, challenge)
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// RFC 7636 §4.1: 43-128 chars of `[A-Za-z0-9-._~]`.
#[must_use]
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Check a verifier against a stored S256 challenge in constant time.
#[must_use]
pub fn verify_pkce(verifier: &str, challenge: &str, method: &str) -> bool {
    if method != PKCE_METHOD_S256 || !is_valid_verifier(verifier) {
        return false;
    }
    s256_challenge(verifier).as_bytes().ct_eq(challenge.as_bytes()).into()
}
