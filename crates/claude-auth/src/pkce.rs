//! PKCE flow material (RFC 7636)
//!
//! A pending login is persisted as an OAuth flow keyed by its code
//! verifier, which doubles as the `state` value: the callback recovers the
//! flow and the token exchange proves origin through one lookup. This
//! module produces the verifier/challenge pair a flow stores and assembles
//! the authorization URL from the fields the flow persists.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::{AUTHORIZE_ENDPOINT, CLIENT_ID, SCOPES};

/// Verifier byte length before encoding. 64 bytes encode to 86 base64url
/// characters, inside the 43-128 range RFC 7636 allows.
const VERIFIER_BYTES: usize = 64;

/// The verifier/challenge pair a flow stores.
///
/// The challenge is always derived from the verifier (S256), so a pair can
/// be reconstructed from a persisted flow without storing both sides.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate fresh flow material: a crypto-random verifier and its
    /// challenge.
    pub fn generate() -> Self {
        let mut bytes = [0u8; VERIFIER_BYTES];
        rand::rng().fill(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Rebuild the pair for a verifier loaded from a stored flow.
    ///
    /// `challenge = BASE64URL(SHA256(verifier))`, the S256 method.
    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let digest = Sha256::digest(verifier.as_bytes());
        Self {
            challenge: URL_SAFE_NO_PAD.encode(digest),
            verifier,
        }
    }
}

/// Assemble the authorization URL for a pending flow.
///
/// Takes exactly what the flow persists: its state key (the verifier), the
/// S256 challenge, and the flow's registered redirect URI. Every value is
/// percent-encoded; redirect URIs in particular are arbitrary per-flow
/// strings.
pub fn authorization_url(state: &str, challenge: &str, redirect_uri: &str) -> String {
    let params = [
        ("client_id", CLIENT_ID),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", SCOPES),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
        ("state", state),
    ];

    let query: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{key}={}", percent_encode(value)))
        .collect();
    format!("{AUTHORIZE_ENDPOINT}?{}", query.join("&"))
}

/// Percent-encode a query value, keeping only the RFC 3986 unreserved set.
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push_str(&format!("{byte:02X}"));
            }
        }
    }
    encoded
}
