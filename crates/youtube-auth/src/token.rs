//! Token records and token endpoint calls
//!
//! Two interactions with the provider's `token_uri`, both form-encoded POSTs:
//! 1. Authorization code exchange (end of interactive consent)
//! 2. Refresh grant (silent renewal of an expired access token)
//!
//! The endpoint comes from the identity document, never from a constant, so
//! the same code talks to a local mock in tests.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_TOKEN_TYPE;
use crate::error::{Error, Result};
use crate::identity::InstalledApp;

/// A stored access credential.
///
/// `expiry` is a unix timestamp in milliseconds (absolute, not a delta),
/// computed from `TokenResponse.expires_in` at the time the response arrived.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration as unix timestamp in milliseconds
    pub expiry: u64,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

/// Absolute expiry in ms. `expires_in` comes from the provider; saturate
/// rather than overflow.
fn expiry_after(now_millis: u64, expires_in_secs: u64) -> u64 {
    now_millis.saturating_add(expires_in_secs.saturating_mul(1000))
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expiry", &self.expiry)
            .field("scopes", &self.scopes)
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl TokenRecord {
    /// Build a record from a fresh code exchange.
    ///
    /// When the provider omits `scope`, the requested scopes are assumed granted.
    pub fn from_exchange(response: TokenResponse, requested: &[&str], now_millis: u64) -> Self {
        let scopes = match response.scope.as_deref() {
            Some(granted) => parse_scopes(granted),
            None => requested.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expiry: expiry_after(now_millis, response.expires_in),
            scopes,
            token_type: response.token_type.unwrap_or_else(default_token_type),
        }
    }

    /// Apply a refresh response. Refresh responses usually omit
    /// `refresh_token` and sometimes `scope`; the previous values carry over.
    pub fn refreshed(&self, response: TokenResponse, now_millis: u64) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            expiry: expiry_after(now_millis, response.expires_in),
            scopes: response
                .scope
                .as_deref()
                .map(parse_scopes)
                .unwrap_or_else(|| self.scopes.clone()),
            token_type: response
                .token_type
                .unwrap_or_else(|| self.token_type.clone()),
        }
    }

    /// Whether the granted scopes are a superset of `required`.
    pub fn covers(&self, required: &[&str]) -> bool {
        required.iter().all(|s| self.scopes.contains(*s))
    }

    /// Whether the token is expired or will be within `skew`.
    pub fn is_expired(&self, now_millis: u64, skew: Duration) -> bool {
        self.expiry <= now_millis.saturating_add(skew.as_millis() as u64)
    }

    /// Required scopes missing from this record, for error messages.
    pub fn missing_scopes<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|s| !self.scopes.contains(*s))
            .collect()
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

fn parse_scopes(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
    /// Space-separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exchange an authorization code for tokens.
///
/// `redirect_uri` must be the exact value used in the authorization URL; the
/// provider rejects the exchange otherwise. Every failure here is fatal to
/// resolution, so it maps straight to `Authorization`.
pub async fn exchange_code(
    client: &reqwest::Client,
    app: &InstalledApp,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(&app.token_uri)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.expose().as_str()),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await
        .map_err(|e| Error::Authorization(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Authorization(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Authorization(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// 401/403, and 400 with `invalid_grant`, mean the grant itself is gone and
/// come back as `RefreshRevoked`. Anything else is `Refresh`.
pub async fn refresh_token(
    client: &reqwest::Client,
    app: &InstalledApp,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(&app.token_uri)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.expose().as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Refresh(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if is_revocation(status.as_u16(), &body) {
            return Err(Error::RefreshRevoked(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::Refresh(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Refresh(format!("invalid refresh response: {e}")))
}

fn is_revocation(status: u16, body: &str) -> bool {
    matches!(status, 401 | 403) || (status == 400 && body.contains("invalid_grant"))
}
