//! Upload authorization for the shorts publisher
//!
//! Resolves an OAuth2 access credential for the bound channel from two files:
//! the encoded client identity document and the token cache. Interactive
//! consent (PKCE, loopback or console) runs only when no cached token can be
//! used or refreshed.
//!
//! Resolution flow:
//! 1. `IdentitySource::load()` decodes the identity (fatal on failure)
//! 2. `TokenCache::load()` reads the cached record (failures mean "no token")
//! 3. `TokenState::classify()` picks ValidToken / ExpiredToken / NoToken
//! 4. ExpiredToken: one `token::refresh_token()` attempt, persisted on success
//! 5. NoToken: `ConsentFlow::obtain_code()` then `token::exchange_code()`,
//!    persisted via `TokenCache::save()`

pub mod cache;
pub mod consent;
pub mod constants;
pub mod error;
pub mod identity;
pub mod manager;
pub mod pkce;
pub mod token;

pub use cache::TokenCache;
pub use consent::{ConsentFlow, ConsentGrant, ConsentRequest, ConsoleConsent, LoopbackConsent};
pub use constants::*;
pub use error::{Error, Result};
pub use identity::{ClientIdentity, IdentitySource, InstalledApp, encode_identity};
pub use manager::{CredentialManager, Resolution, ResolveOutcome, TokenState, resolve_credential};
pub use token::{TokenRecord, TokenResponse, exchange_code, now_millis, refresh_token};
