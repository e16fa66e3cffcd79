//! Port definition for fetching raw image bytes.

use std::time::Duration;

use bytes::Bytes;

use crate::domain::errors::LoadResult;

/// A response body being streamed from a remote source.
#[async_trait::async_trait]
pub trait ImageBody: Send {
    /// Returns the next chunk of the body, or None once it is exhausted.
    async fn next_chunk(&mut self) -> LoadResult<Option<Bytes>>;
}

/// Port for opening remote image sources.
#[async_trait::async_trait]
pub trait ImageFetchPort: Send + Sync {
    /// Opens `url`, following redirects.
    ///
    /// Fails with `NetworkTimeout` if the headers, or any later body chunk, take longer than `timeout`.
    async fn fetch(&self, url: &str, timeout: Duration) -> LoadResult<Box<dyn ImageBody>>;
}

/// Reads a body to the end into a single buffer.
///
/// # Errors
/// Returns the first error produced by the body.
pub async fn read_to_end(body: &mut dyn ImageBody) -> LoadResult<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next_chunk().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}
