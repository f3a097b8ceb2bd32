//! Retrieves remote execution images onto node-local storage.
//!
//! Transfers are plain HTTP(S) GETs streamed straight to disk, so image size
//! never pressures agent memory. Integrity checking is opt-in: callers that
//! have a SHA-256 digest for the artifact verify it before the image is ever
//! handed to a backend process.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{DriverError, Result};

/// Read granularity for on-disk digest computation.
const DIGEST_CHUNK: usize = 64 * 1024;

/// Streams remote artifacts into a task's allocation directory.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Download `url` to the file at `dest`, streaming response chunks to
    /// disk as they arrive.
    ///
    /// No redirects beyond reqwest's defaults, no authentication, no resume:
    /// transfer retry policy belongs to the caller.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let fetch_err = |reason: String| DriverError::Fetch {
            source: url.to_string(),
            reason,
        };

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("unexpected status {}", resp.status())));
        }

        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| fetch_err(format!("creating {}: {}", dest.display(), e)))?;
        while let Some(chunk) = resp.chunk().await.map_err(|e| fetch_err(e.to_string()))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| fetch_err(format!("writing {}: {}", dest.display(), e)))?;
        }
        file.flush()
            .await
            .map_err(|e| fetch_err(format!("flushing {}: {}", dest.display(), e)))?;

        tracing::debug!(url, dest = %dest.display(), "artifact downloaded");
        Ok(())
    }

    /// Compare the SHA-256 digest of the file at `path` against `expected`
    /// (hex, case-insensitive).
    ///
    /// On mismatch the artifact is deleted before the error is returned:
    /// an image that failed verification must not be left on disk where a
    /// later task could pick it up.
    pub async fn verify_checksum(&self, path: &Path, expected: &str) -> Result<()> {
        let io_err = |reason: String| DriverError::Fetch {
            source: path.display().to_string(),
            reason,
        };

        let mut file = fs::File::open(path)
            .await
            .map_err(|e| io_err(format!("opening for checksum: {}", e)))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; DIGEST_CHUNK];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| io_err(format!("reading for checksum: {}", e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let actual: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        if actual != expected.to_ascii_lowercase() {
            tracing::warn!(
                path = %path.display(),
                expected,
                actual = %actual,
                "checksum mismatch, removing artifact"
            );
            if let Err(e) = fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
            }
            return Err(DriverError::Integrity {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

/// Collision-resistant file name for a downloaded artifact: a unique id plus
/// the basename of the source URL, so concurrent tasks fetching the same
/// image never clobber each other.
pub fn unique_artifact_name(prefix: &str, source: &str) -> String {
    let base = source
        .split(['?', '#'])
        .next()
        .unwrap_or(source)
        .rsplit('/')
        .next()
        .filter(|b| !b.is_empty())
        .unwrap_or("artifact");
    format!("{}-{}-{}", prefix, Uuid::new_v4(), base)
}
