//! HTTP chunk loader.
//!
//! Fetches chunks from any static HTTP(S) base by appending the 64-hex
//! chunk name to the base path. Redirects are followed; 404 maps to the
//! store's not-found signal. The loader is read-only: published
//! repositories are served from object stores that are written elsewhere.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use blocktree_core::store::{BlobStore, StoreError};
use blocktree_core::types::{to_hex, Address};

/// Upper bound on a fetched chunk: a full 1 GiB leaf plus envelope
/// overhead. Responses advertising more are rejected before download.
const MAX_CHUNK_BYTES: u64 = (1 << 30) + 256;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only blob store over a static HTTP base URL.
pub struct HttpStore {
    base_url: String,
    http: reqwest::Client,
}

/// HTTP store construction error
#[derive(Debug, thiserror::Error)]
pub enum HttpStoreError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl HttpStore {
    /// Create a loader for `base_url`; chunk names are appended after a
    /// single slash.
    pub fn new(base_url: &str) -> Result<Self, HttpStoreError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| HttpStoreError::Client(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn chunk_url(&self, address: &Address) -> String {
        format!("{}/{}", self.base_url, to_hex(address))
    }
}

#[async_trait]
impl BlobStore for HttpStore {
    async fn put(&self, _address: Address, _bytes: Vec<u8>) -> Result<bool, StoreError> {
        Err(StoreError::Other(
            "HTTP chunk store is read-only".to_string(),
        ))
    }

    async fn get(&self, address: &Address) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.chunk_url(address);
        debug!(%url, "fetching chunk");

        let response = self
            .http
            .get(&url)
            .header("Accept-Encoding", "identity")
            .send()
            .await
            .map_err(|e| StoreError::Other(format!("GET {}: {}", url, e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| StoreError::Other(format!("GET {}: {}", url, e)))?;

        if let Some(length) = response.content_length() {
            if length > MAX_CHUNK_BYTES {
                return Err(StoreError::Other(format!(
                    "chunk {} advertises {} bytes",
                    to_hex(address),
                    length
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Other(format!("GET {}: {}", url, e)))?;
        if bytes.len() as u64 > MAX_CHUNK_BYTES {
            return Err(StoreError::Other(format!(
                "chunk {} body exceeds size bound",
                to_hex(address)
            )));
        }
        Ok(Some(bytes.to_vec()))
    }
}
