//! Resumable chunked upload
//!
//! Protocol:
//! 1. POST metadata to the upload endpoint with `uploadType=resumable`; the
//!    `Location` header of the reply is the session URI.
//! 2. PUT the file in chunks with `Content-Range: bytes a-b/total`. A 308
//!    reply means "keep going" and its `Range` header says how much the server
//!    holds; 200/201 carries the created video resource.
//! 3. When a chunk fails in transit or with a 5xx, ask the session how much it
//!    holds (`Content-Range: bytes */total`, empty body) and resume from there.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};
use youtube_auth::TokenRecord;

use crate::error::{Error, Result};
use crate::metadata::{VideoMetadata, content_type_for};

/// Video upload endpoint of the platform's data API.
pub const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/upload/youtube/v3/videos";

/// Chunk sizes must be a multiple of this (except the final chunk).
pub const CHUNK_ALIGNMENT: usize = 256 * 1024;

/// 8 MiB keeps request count low without holding much in memory.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * CHUNK_ALIGNMENT;

/// Attempts per chunk before giving up (1 initial + 2 resumes).
const MAX_CHUNK_ATTEMPTS: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Progress after an acknowledged chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.bytes_sent as f64 * 100.0 / self.total as f64
    }
}

/// Video resource returned when the upload completes.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedVideo {
    /// Remote identifier of the new video
    pub id: String,
}

enum ChunkOutcome {
    /// Server holds this many bytes
    Incomplete(u64),
    Complete(UploadedVideo),
}

/// Resumable upload client.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: reqwest::Client,
    endpoint: String,
    chunk_size: usize,
    timeout: Duration,
}

impl Uploader {
    /// `chunk_size` must be a positive multiple of `CHUNK_ALIGNMENT`.
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 || chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk size must be a positive multiple of {CHUNK_ALIGNMENT}, got {chunk_size}"
            )));
        }
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            chunk_size,
            timeout: Duration::from_secs(300),
        })
    }

    /// Per-request timeout for session and chunk requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upload `path` with `metadata`, reporting progress after every
    /// acknowledged chunk. Returns the created video.
    #[instrument(skip_all, fields(path = %path.display(), title = %metadata.title))]
    pub async fn upload<F>(
        &self,
        credential: &TokenRecord,
        path: &Path,
        metadata: &VideoMetadata,
        mut on_progress: F,
    ) -> Result<UploadedVideo>
    where
        F: FnMut(UploadProgress),
    {
        metadata.validate()?;

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::Io(format!("opening {}: {e}", path.display())))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| Error::Io(format!("reading metadata of {}: {e}", path.display())))?
            .len();
        if total == 0 {
            return Err(Error::Io(format!("{} is empty", path.display())));
        }

        let bearer = credential.bearer();
        let session = self
            .open_session(&bearer, metadata, total, content_type_for(path))
            .await?;
        info!(total, "upload session opened");

        let mut offset = 0u64;
        let mut attempts = 0u32;
        loop {
            let chunk = read_chunk(&mut file, offset, self.chunk_size, total).await?;
            let chunk_len = chunk.len() as u64;

            match self.put_chunk(&session, &bearer, chunk, offset, total).await {
                Ok(ChunkOutcome::Complete(video)) => {
                    metrics::counter!("upload_chunks_total", "result" => "acked").increment(1);
                    metrics::counter!("upload_bytes_total").increment(total - offset);
                    on_progress(UploadProgress {
                        bytes_sent: total,
                        total,
                    });
                    info!(video_id = %video.id, "upload complete");
                    return Ok(video);
                }
                Ok(ChunkOutcome::Incomplete(held)) if held > offset => {
                    metrics::counter!("upload_chunks_total", "result" => "acked").increment(1);
                    metrics::counter!("upload_bytes_total").increment(held - offset);
                    if held < offset + chunk_len {
                        debug!(offset, held, "server kept a partial chunk");
                    }
                    offset = held;
                    attempts = 0;
                    on_progress(UploadProgress {
                        bytes_sent: offset,
                        total,
                    });
                }
                Ok(ChunkOutcome::Incomplete(held)) => {
                    // Acknowledged nothing new: counts against this chunk
                    attempts += 1;
                    metrics::counter!("upload_chunks_total", "result" => "stalled").increment(1);
                    if attempts >= MAX_CHUNK_ATTEMPTS {
                        return Err(Error::Session(format!(
                            "session made no progress past byte {offset} after {attempts} attempts"
                        )));
                    }
                    warn!(offset, held, attempt = attempts, "chunk not acknowledged, resending");
                    tokio::time::sleep(RETRY_DELAY).await;
                    offset = held;
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    metrics::counter!("upload_chunks_total", "result" => "retried").increment(1);
                    if attempts >= MAX_CHUNK_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(offset, attempt = attempts, error = %e, "chunk failed, querying session");
                    tokio::time::sleep(RETRY_DELAY).await;

                    match self.query_session(&session, &bearer, total).await {
                        Ok(ChunkOutcome::Complete(video)) => {
                            metrics::counter!("upload_chunks_total", "result" => "acked")
                                .increment(1);
                            metrics::counter!("upload_bytes_total").increment(total - offset);
                            on_progress(UploadProgress {
                                bytes_sent: total,
                                total,
                            });
                            info!(video_id = %video.id, "upload complete");
                            return Ok(video);
                        }
                        Ok(ChunkOutcome::Incomplete(held)) => {
                            if held > offset {
                                metrics::counter!("upload_bytes_total").increment(held - offset);
                            }
                            offset = held;
                        }
                        Err(query_err) if query_err.is_retryable() => {
                            warn!(error = %query_err, "session status query failed, resending chunk");
                        }
                        Err(query_err) => return Err(query_err),
                    }
                }
                Err(e) => return Err(e),
            }

            if offset >= total {
                return Err(Error::InvalidResponse(
                    "server acknowledged every byte but did not return the video".into(),
                ));
            }
        }
    }

    async fn open_session(
        &self,
        bearer: &str,
        metadata: &VideoMetadata,
        total: u64,
        content_type: &str,
    ) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            &self.endpoint,
            &[("uploadType", "resumable"), ("part", "snippet,status")],
        )
        .map_err(|e| Error::InvalidConfig(format!("upload endpoint: {e}")))?;

        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, bearer)
            .header("X-Upload-Content-Length", total.to_string())
            .header("X-Upload-Content-Type", content_type)
            .timeout(self.timeout)
            .json(&metadata.request_body())
            .send()
            .await
            .map_err(|e| Error::Http(format!("opening upload session: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(status_error(status, &body));
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Session("upload endpoint returned no Location header".into()))
    }

    async fn put_chunk(
        &self,
        session: &str,
        bearer: &str,
        chunk: Bytes,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome> {
        let last = offset + chunk.len() as u64 - 1;
        debug!(offset, last, total, "sending chunk");
        let response = self
            .client
            .put(session)
            .header(AUTHORIZATION, bearer)
            .header(CONTENT_RANGE, format!("bytes {offset}-{last}/{total}"))
            .header(CONTENT_LENGTH, chunk.len())
            .timeout(self.timeout)
            .body(chunk)
            .send()
            .await
            .map_err(|e| Error::Http(format!("sending chunk at {offset}: {e}")))?;
        interpret(response).await
    }

    async fn query_session(&self, session: &str, bearer: &str, total: u64) -> Result<ChunkOutcome> {
        let response = self
            .client
            .put(session)
            .header(AUTHORIZATION, bearer)
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .header(CONTENT_LENGTH, 0)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(format!("querying upload session: {e}")))?;
        interpret(response).await
    }
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    offset: u64,
    chunk_size: usize,
    total: u64,
) -> Result<Bytes> {
    let len = (total - offset).min(chunk_size as u64) as usize;
    let mut buf = vec![0u8; len];
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| Error::Io(format!("seeking to {offset}: {e}")))?;
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::Io(format!("reading chunk at {offset}: {e}")))?;
    Ok(Bytes::from(buf))
}

async fn interpret(response: reqwest::Response) -> Result<ChunkOutcome> {
    let status = response.status();
    match status.as_u16() {
        200 | 201 => response
            .json::<UploadedVideo>()
            .await
            .map(ChunkOutcome::Complete)
            .map_err(|e| Error::InvalidResponse(format!("video resource: {e}"))),
        308 => {
            let range = response.headers().get(RANGE).and_then(|v| v.to_str().ok());
            next_offset(range).map(ChunkOutcome::Incomplete)
        }
        _ => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            Err(status_error(status, &body))
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    if status.is_server_error() {
        Error::Unavailable(format!("{status}: {body}"))
    } else {
        Error::Rejected(format!("{status}: {body}"))
    }
}

/// Offset to resume from, given a 308 `Range` header (`bytes=0-N`).
/// No header means the server holds nothing yet.
pub fn next_offset(range: Option<&str>) -> Result<u64> {
    let Some(range) = range else {
        return Ok(0);
    };
    let end = range
        .trim()
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .map(|(_, end)| end)
        .ok_or_else(|| Error::InvalidResponse(format!("unparseable Range header: {range}")))?;
    let last = end
        .parse::<u64>()
        .map_err(|e| Error::InvalidResponse(format!("unparseable Range header {range}: {e}")))?;
    last.checked_add(1)
        .ok_or_else(|| Error::InvalidResponse(format!("Range header out of bounds: {range}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PrivacyStatus;
    use axum::body::Bytes as BodyBytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockSession {
        base: Arc<Mutex<String>>,
        received: Arc<Mutex<Vec<u8>>>,
        metadata: Arc<Mutex<Option<serde_json::Value>>>,
        fail_next_puts: Arc<AtomicUsize>,
        /// Store the chunk but answer 503, as if the reply was lost
        lose_next_acks: Arc<AtomicUsize>,
        /// Answer every chunk with a bare 308 and keep nothing
        stall: bool,
        reject_session: bool,
        puts: Arc<AtomicUsize>,
    }

    async fn open_handler(
        State(mock): State<MockSession>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> Response {
        if mock.reject_session || headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer at_upload") {
            return (AxumStatus::FORBIDDEN, "forbidden").into_response();
        }
        *mock.metadata.lock().unwrap() = Some(body);
        let location = format!("{}/session/1", mock.base.lock().unwrap());
        (AxumStatus::OK, [("location", location)]).into_response()
    }

    fn created() -> Response {
        (
            AxumStatus::CREATED,
            axum::Json(serde_json::json!({"kind": "youtube#video", "id": "vid_123"})),
        )
            .into_response()
    }

    fn held_range(received: usize) -> Response {
        if received == 0 {
            AxumStatus::PERMANENT_REDIRECT.into_response()
        } else {
            (
                AxumStatus::PERMANENT_REDIRECT,
                [("range", format!("bytes=0-{}", received - 1))],
            )
                .into_response()
        }
    }

    async fn session_handler(
        State(mock): State<MockSession>,
        headers: HeaderMap,
        body: BodyBytes,
    ) -> Response {
        mock.puts.fetch_add(1, Ordering::SeqCst);
        let content_range = headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let (span, total) = content_range
            .strip_prefix("bytes ")
            .and_then(|r| r.split_once('/'))
            .unwrap();
        let total: usize = total.parse().unwrap();

        if span == "*" {
            let held = mock.received.lock().unwrap().len();
            if held == total {
                return created();
            }
            return held_range(held);
        }

        if mock.stall {
            return AxumStatus::PERMANENT_REDIRECT.into_response();
        }

        if mock
            .fail_next_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return (AxumStatus::SERVICE_UNAVAILABLE, "backend error").into_response();
        }

        let start: usize = span.split_once('-').unwrap().0.parse().unwrap();
        let mut received = mock.received.lock().unwrap();
        assert_eq!(start, received.len(), "chunk must start where the server left off");
        received.extend_from_slice(&body);
        if mock
            .lose_next_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return (AxumStatus::BAD_GATEWAY, "upstream reset").into_response();
        }
        if received.len() == total {
            created()
        } else {
            held_range(received.len())
        }
    }

    async fn start_upload_server(mock: MockSession) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        *mock.base.lock().unwrap() = base.clone();
        let app = axum::Router::new()
            .route("/upload", axum::routing::post(open_handler))
            .route("/session/1", axum::routing::put(session_handler))
            .with_state(mock);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("{base}/upload")
    }

    fn credential() -> TokenRecord {
        TokenRecord {
            access_token: "at_upload".into(),
            refresh_token: None,
            expiry: u64::MAX,
            scopes: BTreeSet::from([youtube_auth::REQUIRED_SCOPES[0].to_string()]),
            token_type: "Bearer".into(),
        }
    }

    fn media_file(dir: &tempfile::TempDir, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("short.mp4");
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn metadata() -> VideoMetadata {
        let mut metadata = VideoMetadata::new("Ocean facts");
        metadata.tags = vec!["shorts".into()];
        metadata.privacy_status = PrivacyStatus::Public;
        metadata
    }

    #[test]
    fn next_offset_parses_range() {
        assert_eq!(next_offset(None).unwrap(), 0);
        assert_eq!(next_offset(Some("bytes=0-262143")).unwrap(), 262_144);
        assert!(next_offset(Some("items=0-5")).is_err());
        assert!(next_offset(Some("bytes=0-x")).is_err());
    }

    #[test]
    fn next_offset_rejects_overflowing_range() {
        let range = format!("bytes=0-{}", u64::MAX);
        let err = next_offset(Some(&range)).unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)), "got: {err:?}");
    }

    #[test]
    fn chunk_size_must_be_aligned() {
        let client = reqwest::Client::new();
        assert!(Uploader::new(client.clone(), DEFAULT_ENDPOINT, 0).is_err());
        assert!(Uploader::new(client.clone(), DEFAULT_ENDPOINT, 1_000_000).is_err());
        assert!(Uploader::new(client, DEFAULT_ENDPOINT, DEFAULT_CHUNK_SIZE).is_ok());
    }

    #[test]
    fn progress_percent() {
        let p = UploadProgress {
            bytes_sent: 50,
            total: 200,
        };
        assert_eq!(p.percent(), 25.0);
    }

    #[tokio::test]
    async fn uploads_in_chunks_and_reports_progress() {
        let mock = MockSession::default();
        let endpoint = start_upload_server(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = media_file(&dir, 2 * CHUNK_ALIGNMENT + 1000);

        let uploader = Uploader::new(reqwest::Client::new(), endpoint, CHUNK_ALIGNMENT).unwrap();
        let mut progress = vec![];
        let video = uploader
            .upload(&credential(), &path, &metadata(), |p| progress.push(p.bytes_sent))
            .await
            .unwrap();

        assert_eq!(video.id, "vid_123");
        assert_eq!(*mock.received.lock().unwrap(), data);
        let total = data.len() as u64;
        assert_eq!(
            progress,
            vec![CHUNK_ALIGNMENT as u64, 2 * CHUNK_ALIGNMENT as u64, total]
        );
        let sent = mock.metadata.lock().unwrap().clone().unwrap();
        assert_eq!(sent["snippet"]["title"], "Ocean facts");
        assert_eq!(sent["status"]["privacyStatus"], "public");
    }

    #[tokio::test]
    async fn resumes_after_server_error() {
        let mock = MockSession::default();
        mock.fail_next_puts.store(1, Ordering::SeqCst);
        let endpoint = start_upload_server(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = media_file(&dir, CHUNK_ALIGNMENT + 10);

        let uploader = Uploader::new(reqwest::Client::new(), endpoint, CHUNK_ALIGNMENT).unwrap();
        let video = uploader
            .upload(&credential(), &path, &metadata(), |_| {})
            .await
            .unwrap();

        assert_eq!(video.id, "vid_123");
        assert_eq!(*mock.received.lock().unwrap(), data);
        // failed chunk + status query + 2 chunks
        assert_eq!(mock.puts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mock = MockSession::default();
        mock.fail_next_puts.store(10, Ordering::SeqCst);
        let endpoint = start_upload_server(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = media_file(&dir, 1000);

        let uploader = Uploader::new(reqwest::Client::new(), endpoint, CHUNK_ALIGNMENT).unwrap();
        let err = uploader
            .upload(&credential(), &path, &metadata(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn stalled_session_gives_up() {
        let mock = MockSession {
            stall: true,
            ..Default::default()
        };
        let endpoint = start_upload_server(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = media_file(&dir, 1000);

        let uploader = Uploader::new(reqwest::Client::new(), endpoint, CHUNK_ALIGNMENT).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            uploader.upload(&credential(), &path, &metadata(), |_| {}),
        )
        .await
        .expect("upload must terminate on a stalled session");

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Session(_)), "got: {err:?}");
        assert_eq!(mock.puts.load(Ordering::SeqCst), MAX_CHUNK_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn lost_final_ack_counts_delivered_bytes() {
        let mock = MockSession::default();
        mock.lose_next_acks.store(1, Ordering::SeqCst);
        let endpoint = start_upload_server(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = media_file(&dir, 1000);

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _local = metrics::set_default_local_recorder(&recorder);

        let uploader = Uploader::new(reqwest::Client::new(), endpoint, CHUNK_ALIGNMENT).unwrap();
        let video = uploader
            .upload(&credential(), &path, &metadata(), |_| {})
            .await
            .unwrap();

        assert_eq!(video.id, "vid_123");
        assert_eq!(*mock.received.lock().unwrap(), data);
        // lost chunk ack + status query
        assert_eq!(mock.puts.load(Ordering::SeqCst), 2);

        let rendered = handle.render();
        assert!(rendered.contains("upload_bytes_total 1000"), "got: {rendered}");
        assert!(
            rendered.contains(r#"upload_chunks_total{result="acked"} 1"#),
            "got: {rendered}"
        );
    }

    #[tokio::test]
    async fn rejected_session_is_fatal() {
        let mock = MockSession {
            reject_session: true,
            ..Default::default()
        };
        let endpoint = start_upload_server(mock.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = media_file(&dir, 1000);

        let uploader = Uploader::new(reqwest::Client::new(), endpoint, CHUNK_ALIGNMENT).unwrap();
        let err = uploader
            .upload(&credential(), &path, &metadata(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected(_)), "got: {err:?}");
        assert_eq!(mock.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = media_file(&dir, 0);
        let uploader =
            Uploader::new(reqwest::Client::new(), "http://127.0.0.1:1/upload", CHUNK_ALIGNMENT)
                .unwrap();
        let err = uploader
            .upload(&credential(), &path, &metadata(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got: {err:?}");
    }
}
