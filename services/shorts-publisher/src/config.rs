//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The identity document may also arrive inline through
//! SHORTS_CLIENT_SECRETS (as CI jobs do), never through the TOML, so the
//! client secret is not committed alongside the config.

use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use youtube_auth::{ConsentFlow, ConsoleConsent, IdentitySource, LoopbackConsent};
use youtube_upload::{
    CHUNK_ALIGNMENT, DEFAULT_CATEGORY_ID, DEFAULT_CHUNK_SIZE, DEFAULT_ENDPOINT, PrivacyStatus,
};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// How interactive consent is collected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentMode {
    #[default]
    Loopback,
    Console,
}

/// Credential resolution settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    #[serde(default)]
    pub consent: ConsentMode,
    /// 0 picks an ephemeral port
    #[serde(default)]
    pub loopback_port: u16,
    /// 0 waits indefinitely
    #[serde(default)]
    pub consent_timeout_secs: u64,
    #[serde(default = "default_expiry_skew")]
    pub expiry_skew_secs: u64,
    /// Encoded identity from SHORTS_CLIENT_SECRETS
    #[serde(skip)]
    pub inline_identity: Option<Secret<String>>,
}

/// Upload settings
#[derive(Debug, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub privacy_status: PrivacyStatus,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Prometheus textfile output
#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

fn default_identity_path() -> PathBuf {
    PathBuf::from("client_secret.b64")
}

fn default_token_path() -> PathBuf {
    PathBuf::from("token.json")
}

fn default_expiry_skew() -> u64 {
    60
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_category() -> String {
    DEFAULT_CATEGORY_ID.to_string()
}

fn default_timeout() -> u64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_path: default_identity_path(),
            token_path: default_token_path(),
            consent: ConsentMode::default(),
            loopback_port: 0,
            consent_timeout_secs: 0,
            expiry_skew_secs: default_expiry_skew(),
            inline_identity: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            chunk_size: default_chunk_size(),
            privacy_status: PrivacyStatus::default(),
            category: default_category(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Identity resolution order:
    /// 1. SHORTS_CLIENT_SECRETS env var (encoded document, inline)
    /// 2. SHORTS_IDENTITY_PATH env var
    /// 3. auth.identity_path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(p) = std::env::var("SHORTS_IDENTITY_PATH") {
            config.auth.identity_path = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("SHORTS_TOKEN_PATH") {
            config.auth.token_path = PathBuf::from(p);
        }
        if let Ok(encoded) = std::env::var("SHORTS_CLIENT_SECRETS") {
            let encoded = encoded.trim().to_owned();
            if !encoded.is_empty() {
                config.auth.inline_identity = Some(Secret::new(encoded));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upload.endpoint.starts_with("http://")
            && !self.upload.endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upload.endpoint must start with http:// or https://, got: {}",
                self.upload.endpoint
            )));
        }

        if self.upload.chunk_size == 0 || self.upload.chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(common::Error::Config(format!(
                "upload.chunk_size must be a positive multiple of {CHUNK_ALIGNMENT}, got: {}",
                self.upload.chunk_size
            )));
        }

        if self.upload.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upload.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.upload.category.is_empty()
            || !self.upload.category.chars().all(|c| c.is_ascii_digit())
        {
            return Err(common::Error::Config(format!(
                "upload.category must be a numeric category id, got: {:?}",
                self.upload.category
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("shorts-publisher.toml")
    }
}

impl AuthConfig {
    pub fn identity_source(&self) -> IdentitySource {
        match &self.inline_identity {
            Some(encoded) => IdentitySource::Inline(encoded.clone()),
            None => IdentitySource::File(self.identity_path.clone()),
        }
    }

    pub fn consent_flow(&self) -> Box<dyn ConsentFlow> {
        match self.consent {
            ConsentMode::Loopback => {
                let timeout = (self.consent_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.consent_timeout_secs));
                Box::new(LoopbackConsent::new(self.loopback_port, timeout))
            }
            ConsentMode::Console => Box::new(ConsoleConsent::default()),
        }
    }

    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_secs)
    }
}
