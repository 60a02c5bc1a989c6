//! WebDAV transport.
//!
//! The transport is stateless with respect to dataset semantics: callers
//! hand it server-relative paths and it moves bytes. Every operation is
//! single-attempt; retry policy belongs to the synchronizer and pipeline,
//! which share [`RETRY_ATTEMPTS`] and [`backoff_delay`].

pub mod webdav;

pub use webdav::WebDavClient;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::{INDEX_FILE, META_DIR, SCHEMA_FILE};

/// Retries for a network operation, including the first attempt.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Exponential backoff between attempts: 100 ms, 400 ms, 1.6 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 * 4u64.pow(attempt.saturating_sub(1)))
}

pub fn remote_schema_path() -> String {
    format!("{}/{}", META_DIR, SCHEMA_FILE)
}

pub fn remote_index_path() -> String {
    format!("{}/{}", META_DIR, INDEX_FILE)
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bad remote URL: {0}")]
    BadUrl(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status} for {path}")]
    Status { status: u16, path: String },
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("malformed PROPFIND response: {0}")]
    Propfind(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recognized transport options.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Sizes the connection pool, which caps simultaneous TCP/TLS
    /// connections.
    pub parallel_connections: usize,
    pub use_http2: bool,
    pub basic_auth: Option<(String, String)>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attach a timing recorder to every operation.
    pub profile: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            parallel_connections: 4,
            use_http2: false,
            basic_auth: None,
            timeout: Duration::from_secs(60),
            profile: false,
        }
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Server-relative path.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// A remote dataset origin.
///
/// Implemented by the production WebDAV client and by the in-memory mock in
/// `test_support`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Bytes of the remote `.blackbird/schema.json`.
    async fn fetch_schema(&self) -> Result<Vec<u8>, TransportError>;

    /// Bytes of the canonical remote index file. A sync always fetches the
    /// remote index in full before planning.
    async fn fetch_index(&self) -> Result<Vec<u8>, TransportError>;

    /// Directory entries under `remote_dir` (PROPFIND depth 1). Rarely
    /// needed; the remote index is authoritative.
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    /// Download `remote_rel` into `local_abs`, returning the byte count.
    /// Single attempt; the parent directory must already exist.
    async fn download(&self, remote_rel: &str, local_abs: &Path) -> Result<u64, TransportError>;

    /// Upload `local_abs` to `remote_rel`, creating missing remote parents.
    async fn upload(&self, local_abs: &Path, remote_rel: &str) -> Result<(), TransportError>;

    /// Reachability probe. A 404 on the probe target is still reachable.
    async fn check(&self) -> Result<(), TransportError>;
}
