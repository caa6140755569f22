//! Upload authorization constants
//!
//! The OAuth client itself (id, secret, endpoints) comes from the identity
//! document issued by the provider. Only the permission set and the timing
//! policy are fixed here.

use std::time::Duration;

/// Scopes every usable token must carry. Uploading a video needs nothing else.
pub const REQUIRED_SCOPES: &[&str] = &["https://www.googleapis.com/auth/youtube.upload"];

/// Tokens expiring within this window are treated as already expired, so the
/// uploader never starts a long transfer with a token about to lapse.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Value of `token_type` when the provider omits it.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";
