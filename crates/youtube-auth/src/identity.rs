//! Client identity document
//!
//! The provider issues an "installed application" JSON document when the
//! application is registered. It is kept at rest as standard base64 over the
//! UTF-8 JSON bytes and only ever decoded in memory. Any decode, parse or
//! shape failure is `MalformedIdentity`, which is fatal to resolution.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Top-level identity document: `{ "installed": { ... } }`.
#[derive(Debug, Deserialize)]
pub struct ClientIdentity {
    pub installed: InstalledApp,
}

/// Registered installed-application client.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub auth_uri: String,
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl ClientIdentity {
    /// Decode the at-rest form. Whitespace (including line wrapping) is ignored.
    pub fn decode(encoded: &str) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(Error::MalformedIdentity("identity document is empty".into()));
        }

        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| Error::MalformedIdentity(format!("invalid base64: {e}")))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| Error::MalformedIdentity(format!("decoded bytes are not UTF-8: {e}")))?;

        Self::from_json(&json)
    }

    /// Parse and validate the plain JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let identity: ClientIdentity = serde_json::from_str(json)
            .map_err(|e| Error::MalformedIdentity(format!("invalid identity JSON: {e}")))?;
        identity.installed.validate()?;
        Ok(identity)
    }
}

impl InstalledApp {
    fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::MalformedIdentity("client_id is empty".into()));
        }
        if self.client_secret.expose().is_empty() {
            return Err(Error::MalformedIdentity("client_secret is empty".into()));
        }
        for (field, value) in [("auth_uri", &self.auth_uri), ("token_uri", &self.token_uri)] {
            let url = reqwest::Url::parse(value)
                .map_err(|e| Error::MalformedIdentity(format!("{field} is not a URL: {e}")))?;
            if url.scheme() != "https" && url.scheme() != "http" {
                return Err(Error::MalformedIdentity(format!(
                    "{field} must use http(s), got: {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Produce the at-rest form of a provider-issued identity JSON.
///
/// The JSON is validated first so a broken download is caught at bootstrap
/// time rather than on the first scheduled run.
pub fn encode_identity(json: &str) -> Result<String> {
    let json = json.trim();
    ClientIdentity::from_json(json)?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Where the encoded identity document comes from.
#[derive(Debug, Clone)]
pub enum IdentitySource {
    /// Encoded document on disk.
    File(PathBuf),
    /// Encoded document passed in directly (e.g. from a CI secret).
    Inline(Secret<String>),
}

impl IdentitySource {
    /// Read and decode the identity. A missing or unreadable file is as fatal
    /// as a corrupt one.
    pub async fn load(&self) -> Result<ClientIdentity> {
        match self {
            IdentitySource::File(path) => {
                let encoded = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::MalformedIdentity(format!(
                        "reading identity file {}: {e}",
                        path.display()
                    ))
                })?;
                let identity = ClientIdentity::decode(&encoded)?;
                debug!(path = %path.display(), client_id = %identity.installed.client_id, "decoded client identity");
                Ok(identity)
            }
            IdentitySource::Inline(encoded) => {
                let identity = ClientIdentity::decode(encoded.expose())?;
                debug!(client_id = %identity.installed.client_id, "decoded inline client identity");
                Ok(identity)
            }
        }
    }
}
