//! Content hashing: streams a file in fixed-size chunks and produces its digest.
//!
//! Memory use is bounded by the chunk size regardless of input length.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tagvault_meta::Digest;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::IngestError;

/// Default read granularity (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Hash function used to identify content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestAlgorithm {
    /// SHA-256, hex-compatible with existing catalogs
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

enum Engine {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Engine {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Engine::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Blake3 => Engine::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Engine::Sha256(h) => h.update(data),
            Engine::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finish(self) -> Digest {
        let mut out = [0u8; 32];
        match self {
            Engine::Sha256(h) => out.copy_from_slice(&h.finalize()),
            Engine::Blake3(h) => out.copy_from_slice(h.finalize().as_bytes()),
        }
        Digest(out)
    }
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Digest {
    let mut engine = Engine::new(algorithm);
    engine.update(data);
    engine.finish()
}

/// Result of hashing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashOutput {
    /// Content digest
    pub digest: Digest,
    /// Total bytes consumed
    pub bytes: u64,
}

/// Chunked streaming hasher.
#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
    algorithm: DigestAlgorithm,
    chunk_size: usize,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(DigestAlgorithm::default(), DEFAULT_CHUNK_SIZE)
    }
}

impl ContentHasher {
    /// Creates a hasher. A zero chunk size falls back to the default.
    pub fn new(algorithm: DigestAlgorithm, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            algorithm,
            chunk_size,
        }
    }

    /// Algorithm in use.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Read size per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Hash everything `reader` yields. `progress` receives the cumulative
    /// byte count after each chunk. A read failure aborts with no digest.
    pub async fn hash_reader<R, F>(
        &self,
        mut reader: R,
        mut progress: F,
    ) -> Result<HashOutput, IngestError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(u64),
    {
        let mut engine = Engine::new(self.algorithm);
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            engine.update(&buf[..n]);
            total += n as u64;
            progress(total);
        }
        Ok(HashOutput {
            digest: engine.finish(),
            bytes: total,
        })
    }

    /// Hash the file at `path`.
    pub async fn hash_file<F>(&self, path: &Path, progress: F) -> Result<HashOutput, IngestError>
    where
        F: FnMut(u64),
    {
        let file = tokio::fs::File::open(path).await?;
        self.hash_reader(file, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[tokio::test]
    async fn test_known_sha256_vectors() {
        let hasher = ContentHasher::default();
        let out = hasher.hash_reader(&b""[..], |_| {}).await.unwrap();
        assert_eq!(out.digest.to_hex(), EMPTY_SHA256);
        assert_eq!(out.bytes, 0);

        let out = hasher.hash_reader(&b"abc"[..], |_| {}).await.unwrap();
        assert_eq!(out.digest.to_hex(), ABC_SHA256);
        assert_eq!(out.bytes, 3);
    }

    #[tokio::test]
    async fn test_blake3_matches_oneshot() {
        let data = vec![7u8; 10_000];
        let hasher = ContentHasher::new(DigestAlgorithm::Blake3, 1000);
        let out = hasher.hash_reader(&data[..], |_| {}).await.unwrap();
        assert_eq!(out.digest.0, *blake3::hash(&data).as_bytes());
    }

    #[tokio::test]
    async fn test_progress_is_cumulative() {
        let data = vec![1u8; 2500];
        let hasher = ContentHasher::new(DigestAlgorithm::Sha256, 1000);
        let mut seen = Vec::new();
        hasher
            .hash_reader(&data[..], |done| seen.push(done))
            .await
            .unwrap();
        assert_eq!(seen.last(), Some(&2500));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        let out = ContentHasher::default()
            .hash_file(&path, |_| {})
            .await
            .unwrap();
        assert_eq!(out.digest.to_hex(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = ContentHasher::default()
            .hash_file(Path::new("/nonexistent/tagvault/file"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.served {
                Poll::Ready(Err(std::io::Error::other("disk went away")))
            } else {
                self.served = true;
                buf.put_slice(b"partial");
                Poll::Ready(Ok(()))
            }
        }
    }

    #[tokio::test]
    async fn test_read_failure_aborts() {
        let err = ContentHasher::default()
            .hash_reader(FailingReader { served: false }, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
    }

    proptest! {
        #[test]
        fn prop_chunk_size_does_not_change_digest(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk in 1usize..512,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let chunked = rt
                .block_on(ContentHasher::new(DigestAlgorithm::Sha256, chunk).hash_reader(&data[..], |_| {}))
                .unwrap();
            prop_assert_eq!(chunked.digest, digest_bytes(DigestAlgorithm::Sha256, &data));
            prop_assert_eq!(chunked.bytes, data.len() as u64);
        }
    }
}
