//! PKCE (Proof Key for Code Exchange) per RFC 7636, plus the consent URL
//!
//! The verifier stays in process memory for the duration of one interactive
//! authorization; the S256 challenge goes into the authorization URL so the
//! provider can tie the later code exchange to this process.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::identity::InstalledApp;

/// Generate a cryptographically random PKCE code verifier.
///
/// 96 random bytes encode to 128 URL-safe base64 characters, the RFC 7636
/// upper bound.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 96];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Opaque anti-CSRF value echoed back by the provider in the callback.
pub fn generate_state() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()
}

/// Build the consent URL from the identity's `auth_uri`.
///
/// `access_type=offline` and `prompt=consent` make the provider issue a
/// refresh token even when the account has consented before.
pub fn build_authorization_url(
    app: &InstalledApp,
    redirect_uri: &str,
    scopes: &[&str],
    state: &str,
    challenge: &str,
) -> Result<String> {
    let scope = scopes.join(" ");
    let url = reqwest::Url::parse_with_params(
        &app.auth_uri,
        &[
            ("client_id", app.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| Error::Authorization(format!("building authorization URL: {e}")))?;
    Ok(url.into())
}
