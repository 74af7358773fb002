//! Exclusive handle over one upstream response body.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};

use crate::error::BridgeError;

pub type ChunkStream = BoxStream<'static, Result<Bytes, BridgeError>>;

/// Owns the upstream body until released. Releasing drops the body, which
/// aborts the underlying HTTP response; reads after release fail instead of
/// silently returning end-of-stream.
pub struct UpstreamReader {
    inner: Option<ChunkStream>,
}

impl UpstreamReader {
    #[must_use]
    pub fn new(stream: ChunkStream) -> Self {
        Self {
            inner: Some(stream),
        }
    }

    #[must_use]
    pub fn from_response(response: reqwest::Response) -> Self {
        let stream = response
            .bytes_stream()
            .map_err(|err| BridgeError::Transport(format!("Upstream stream read failed: {err}")));
        Self::new(stream.boxed())
    }

    /// Next raw chunk; `Ok(None)` at end of body.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] on a read failure and
    /// [`BridgeError::Internal`] when the reader was already released.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BridgeError> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(BridgeError::Internal(
                "upstream reader already released".to_string(),
            ));
        };
        inner.next().await.transpose()
    }

    /// Drop the upstream body. Returns `false` when it was already released,
    /// so calling this on every exit path is safe.
    pub fn release(&mut self) -> bool {
        self.inner.take().is_some()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }
}

impl std::fmt::Debug for UpstreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamReader")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn reader(chunks: &[&'static str]) -> UpstreamReader {
        let items: Vec<Result<Bytes, BridgeError>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        UpstreamReader::new(stream::iter(items).boxed())
    }

    #[tokio::test]
    async fn test_reads_until_end() {
        let mut reader = reader(&["a", "b"]);
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "a");
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "b");
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_after_release_fails() {
        let mut reader = reader(&["a"]);
        assert!(reader.release());
        assert!(reader.is_released());
        assert!(matches!(
            reader.next_chunk().await,
            Err(BridgeError::Internal(_))
        ));
    }

    #[test]
    fn test_double_release_is_safe() {
        let mut reader = reader(&[]);
        assert!(reader.release());
        assert!(!reader.release());
        assert!(reader.is_released());
    }
}
