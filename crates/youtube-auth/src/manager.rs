//! Credential resolution state machine
//!
//! Produces a usable upload credential from the identity document and the
//! token cache:
//!
//! - `ValidToken`: cached record is unexpired and carries the required
//!   scopes. Returned as-is, nothing written.
//! - `ExpiredToken`: cached record is expired but has a refresh token. One
//!   refresh attempt; success is persisted and returned, failure falls
//!   through to `NoToken`.
//! - `NoToken`: no usable record. Interactive consent, code exchange, persist.
//!
//! At most one write to the token cache per resolve. The whole sequence runs
//! under an in-process mutex so concurrent callers sharing a manager never
//! race each other's read-refresh-write.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::TokenCache;
use crate::constants::{DEFAULT_EXPIRY_SKEW, REQUIRED_SCOPES};
use crate::consent::{ConsentFlow, ConsentRequest};
use crate::error::{Error, Result};
use crate::identity::{IdentitySource, InstalledApp};
use crate::pkce::{compute_challenge, generate_state, generate_verifier};
use crate::token::{TokenRecord, exchange_code, now_millis, refresh_token};

/// Classification of the cached record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    ExpiredToken(TokenRecord),
    ValidToken(TokenRecord),
}

impl TokenState {
    /// Classify a loaded record against the required scopes.
    ///
    /// Records lacking a required scope are `NoToken`: refreshing cannot add
    /// scopes. Expired records without a refresh token are `NoToken` too.
    pub fn classify(
        record: Option<TokenRecord>,
        required: &[&str],
        now_millis: u64,
        skew: Duration,
    ) -> Self {
        let Some(record) = record else {
            return TokenState::NoToken;
        };
        if !record.covers(required) {
            debug!(missing = ?record.missing_scopes(required), "cached token lacks required scopes");
            return TokenState::NoToken;
        }
        if !record.is_expired(now_millis, skew) {
            return TokenState::ValidToken(record);
        }
        if record.refresh_token.is_some() {
            TokenState::ExpiredToken(record)
        } else {
            debug!("cached token expired with no refresh token");
            TokenState::NoToken
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TokenState::NoToken => "no_token",
            TokenState::ExpiredToken(_) => "expired_token",
            TokenState::ValidToken(_) => "valid_token",
        }
    }
}

/// Which path produced the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Cached token used unchanged, no write
    Cached,
    /// Cached token refreshed and persisted
    Refreshed,
    /// Fresh interactive authorization, persisted
    Authorized,
}

impl ResolveOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ResolveOutcome::Cached => "cached",
            ResolveOutcome::Refreshed => "refreshed",
            ResolveOutcome::Authorized => "authorized",
        }
    }
}

/// A resolved credential and how it was obtained.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub credential: TokenRecord,
    pub outcome: ResolveOutcome,
}

/// Resolves upload credentials for one bound account.
///
/// Owns exclusive write access to the token cache for the duration of each
/// `resolve` call.
pub struct CredentialManager {
    identity: IdentitySource,
    cache: TokenCache,
    consent: Box<dyn ConsentFlow>,
    http_client: reqwest::Client,
    expiry_skew: Duration,
    guard: Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        identity: IdentitySource,
        cache: TokenCache,
        consent: Box<dyn ConsentFlow>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            identity,
            cache,
            consent,
            http_client,
            expiry_skew: DEFAULT_EXPIRY_SKEW,
            guard: Mutex::new(()),
        }
    }

    /// Treat tokens expiring within `skew` as expired.
    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Resolve a usable credential.
    ///
    /// Fails only with `MalformedIdentity` (before any network or consent
    /// activity) or `Authorization` (interactive path failed).
    pub async fn resolve(&self) -> Result<Resolution> {
        let _guard = self.guard.lock().await;
        let result = self.resolve_locked().await;
        if result.is_err() {
            metrics::counter!("credential_resolutions_total", "outcome" => "failed").increment(1);
        }
        result
    }

    async fn resolve_locked(&self) -> Result<Resolution> {
        let identity = self.identity.load().await?;
        let app = &identity.installed;

        let cached = match self.cache.load().await {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.cache.path().display(), error = %e, "ignoring unusable token cache");
                None
            }
        };

        let now = now_millis();
        let state = TokenState::classify(cached, REQUIRED_SCOPES, now, self.expiry_skew);
        debug!(state = state.label(), "classified cached token");

        match state {
            TokenState::ValidToken(credential) => {
                return Ok(self.finish(credential, ResolveOutcome::Cached));
            }
            TokenState::ExpiredToken(record) => match self.refresh(app, &record).await {
                Ok(refreshed) => {
                    self.persist(&refreshed).await;
                    return Ok(self.finish(refreshed, ResolveOutcome::Refreshed));
                }
                Err(e) => {
                    warn!(error = %e, "refresh failed, falling back to interactive authorization");
                }
            },
            TokenState::NoToken => {}
        }

        let credential = self.authorize(app).await?;
        self.persist(&credential).await;
        Ok(self.finish(credential, ResolveOutcome::Authorized))
    }

    /// Exactly one refresh attempt. Any failure, including a refreshed record
    /// that no longer satisfies the scope invariant, is recoverable.
    async fn refresh(&self, app: &InstalledApp, record: &TokenRecord) -> Result<TokenRecord> {
        let Some(refresh) = record.refresh_token.as_deref() else {
            return Err(Error::Refresh("no refresh token".into()));
        };

        let result = refresh_token(&self.http_client, app, refresh)
            .await
            .and_then(|response| {
                let now = now_millis();
                let refreshed = record.refreshed(response, now);
                if !refreshed.covers(REQUIRED_SCOPES) {
                    return Err(Error::Refresh(format!(
                        "refreshed token missing scopes: {:?}",
                        refreshed.missing_scopes(REQUIRED_SCOPES)
                    )));
                }
                if refreshed.is_expired(now, Duration::ZERO) {
                    return Err(Error::Refresh("refreshed token already expired".into()));
                }
                Ok(refreshed)
            });

        let label = match &result {
            Ok(_) => "success",
            Err(Error::RefreshRevoked(_)) => "revoked",
            Err(_) => "failed",
        };
        metrics::counter!("token_refresh_total", "result" => label).increment(1);

        if result.is_ok() {
            info!("token refresh succeeded");
        }
        result
    }

    /// Interactive consent and code exchange.
    async fn authorize(&self, app: &InstalledApp) -> Result<TokenRecord> {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        let state = generate_state();

        info!(flow = self.consent.id(), "starting interactive authorization");
        let grant = self
            .consent
            .obtain_code(ConsentRequest {
                app,
                scopes: REQUIRED_SCOPES,
                state: &state,
                challenge: &challenge,
            })
            .await?;

        let response = exchange_code(
            &self.http_client,
            app,
            &grant.code,
            &verifier,
            &grant.redirect_uri,
        )
        .await?;

        let credential = TokenRecord::from_exchange(response, REQUIRED_SCOPES, now_millis());
        if !credential.covers(REQUIRED_SCOPES) {
            return Err(Error::Authorization(format!(
                "granted scopes missing required: {:?}",
                credential.missing_scopes(REQUIRED_SCOPES)
            )));
        }
        if credential.refresh_token.is_none() {
            warn!("provider issued no refresh token; the next expiry will need consent again");
        }
        info!("interactive authorization succeeded");
        Ok(credential)
    }

    /// Persist failures are logged, not surfaced: the credential in hand is
    /// still valid for this run.
    async fn persist(&self, credential: &TokenRecord) {
        if let Err(e) = self.cache.save(credential).await {
            warn!(path = %self.cache.path().display(), error = %e, "failed to persist token");
        }
    }

    fn finish(&self, credential: TokenRecord, outcome: ResolveOutcome) -> Resolution {
        metrics::counter!("credential_resolutions_total", "outcome" => outcome.label())
            .increment(1);
        info!(
            outcome = outcome.label(),
            expiry = credential.expiry,
            "credential resolved"
        );
        Resolution {
            credential,
            outcome,
        }
    }
}

/// One-shot resolution from an identity file and a token cache path.
pub async fn resolve_credential(
    identity_path: impl Into<std::path::PathBuf>,
    token_path: impl Into<std::path::PathBuf>,
    consent: Box<dyn ConsentFlow>,
) -> Result<TokenRecord> {
    let manager = CredentialManager::new(
        IdentitySource::File(identity_path.into()),
        TokenCache::new(token_path),
        consent,
        reqwest::Client::new(),
    );
    manager.resolve().await.map(|r| r.credential)
}
