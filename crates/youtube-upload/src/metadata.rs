//! Video metadata sent when the upload session is opened

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest title the platform accepts, in characters.
pub const MAX_TITLE_CHARS: usize = 100;
/// Longest description the platform accepts, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;
/// "People & Blogs", the platform's default category.
pub const DEFAULT_CATEGORY_ID: &str = "22";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    #[default]
    Private,
    Unlisted,
    Public,
}

impl PrivacyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyStatus::Private => "private",
            PrivacyStatus::Unlisted => "unlisted",
            PrivacyStatus::Public => "public",
        }
    }
}

impl fmt::Display for PrivacyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivacyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(PrivacyStatus::Private),
            "unlisted" => Ok(PrivacyStatus::Unlisted),
            "public" => Ok(PrivacyStatus::Public),
            other => Err(Error::InvalidMetadata(format!(
                "privacy status must be private, unlisted or public, got: {other}"
            ))),
        }
    }
}

/// Title, description, category and tags for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub category_id: String,
    pub tags: Vec<String>,
    pub privacy_status: PrivacyStatus,
}

impl VideoMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            category_id: DEFAULT_CATEGORY_ID.to_string(),
            tags: Vec::new(),
            privacy_status: PrivacyStatus::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidMetadata("title is empty".into()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(Error::InvalidMetadata(format!(
                "title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(Error::InvalidMetadata(format!(
                "description exceeds {MAX_DESCRIPTION_CHARS} characters"
            )));
        }
        // The platform rejects angle brackets in titles and descriptions
        if self.title.contains(['<', '>']) || self.description.contains(['<', '>']) {
            return Err(Error::InvalidMetadata(
                "title and description must not contain '<' or '>'".into(),
            ));
        }
        if self.category_id.is_empty() || !self.category_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidMetadata(format!(
                "category id must be numeric, got: {:?}",
                self.category_id
            )));
        }
        Ok(())
    }

    /// JSON body for the session-opening request (`part=snippet,status`).
    pub fn request_body(&self) -> serde_json::Value {
        let tags: Vec<&str> = self
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        serde_json::json!({
            "snippet": {
                "title": self.title.trim(),
                "description": self.description,
                "tags": tags,
                "categoryId": self.category_id,
            },
            "status": {
                "privacyStatus": self.privacy_status.as_str(),
                "selfDeclaredMadeForKids": false,
            }
        })
    }
}

/// MIME type for the media file, from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
