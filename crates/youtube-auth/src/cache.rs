//! Token cache file
//!
//! One JSON `TokenRecord` on disk. Writes use atomic temp-file + rename so a
//! crash mid-write never leaves a truncated cache behind. Loading reports a
//! missing file as `Ok(None)` and anything unreadable as `TokenLoad`; the
//! manager decides that both mean "no token".

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenRecord;

/// Token cache at a fixed path.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached record, if any.
    pub async fn load(&self) -> Result<Option<TokenRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "token cache not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::TokenLoad(format!(
                    "reading {}: {e}",
                    self.path.display()
                )));
            }
        };

        let record: TokenRecord = serde_json::from_str(&contents).map_err(|e| {
            Error::TokenLoad(format!("parsing {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), expiry = record.expiry, "loaded cached token");
        Ok(Some(record))
    }

    /// Replace the cached record.
    pub async fn save(&self, record: &TokenRecord) -> Result<()> {
        write_atomic(&self.path, record).await
    }
}

/// Write a token record atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets permissions to 0600 (owner read/write only) since the file
/// holds a refresh token.
async fn write_atomic(path: &Path, record: &TokenRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| Error::Io(format!("serializing token record: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating token directory: {e}")))?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("token.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token");
    Ok(())
}
