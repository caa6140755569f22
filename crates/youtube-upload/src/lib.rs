//! Resumable video upload for the shorts publisher
//!
//! Takes a resolved credential from `youtube-auth` and pushes a rendered
//! media file to the platform in aligned chunks, resuming from the server's
//! acknowledged offset when a chunk fails in transit.

pub mod error;
pub mod metadata;
pub mod resumable;

pub use error::{Error, Result};
pub use metadata::{DEFAULT_CATEGORY_ID, PrivacyStatus, VideoMetadata, content_type_for};
pub use resumable::{
    CHUNK_ALIGNMENT, DEFAULT_CHUNK_SIZE, DEFAULT_ENDPOINT, UploadProgress, UploadedVideo, Uploader,
    next_offset,
};
