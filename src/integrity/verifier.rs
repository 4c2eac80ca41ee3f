use crate::integrity::error::{IntegrityError, IntegrityResult};
use crate::integrity::types::{BatchVerificationSummary, FailedChunk};
use crate::metadata::DownloadChunkInfo;
use blake3::Hasher;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::warn;

/// Staged chunks verified concurrently.
const VERIFY_CONCURRENCY: usize = 4;

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// BLAKE3 digest of a byte slice as lowercase hex
    pub fn chunk_hash(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    /// BLAKE3 digest of a file (streaming)
    pub async fn file_hash(path: &Path) -> IntegrityResult<String> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            IntegrityError::FileNotFound(format!("{}: {}", path.display(), e))
        })?;

        let mut hasher = Hasher::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Compare `data` against a recorded hash. Hex case is ignored.
    pub fn verify_chunk(expected: &str, data: &[u8]) -> IntegrityResult<()> {
        let actual = Self::chunk_hash(data);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(IntegrityError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Check one staged download chunk against its recorded hash.
    pub async fn verify_staged_chunk(chunk: &DownloadChunkInfo) -> IntegrityResult<()> {
        let expected = chunk
            .chunk_hash
            .as_deref()
            .ok_or(IntegrityError::MissingHash(chunk.chunk_number))?;
        let staged = chunk
            .temp_path
            .as_deref()
            .ok_or(IntegrityError::NotStaged(chunk.chunk_number))?;

        let actual = Self::file_hash(Path::new(staged)).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(IntegrityError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Verify every staged chunk of a download before reassembly.
    pub async fn verify_staged_chunks(chunks: &[DownloadChunkInfo]) -> BatchVerificationSummary {
        use futures::stream::{self, StreamExt};

        let results: Vec<(u32, IntegrityResult<()>)> = stream::iter(chunks)
            .map(|chunk| async move { (chunk.chunk_number, Self::verify_staged_chunk(chunk).await) })
            .buffer_unordered(VERIFY_CONCURRENCY)
            .collect()
            .await;

        let mut failed_chunks: Vec<FailedChunk> = results
            .into_iter()
            .filter_map(|(chunk_number, result)| {
                result.err().map(|e| FailedChunk {
                    chunk_number,
                    error: e.to_string(),
                })
            })
            .collect();
        failed_chunks.sort_by_key(|f| f.chunk_number);

        for failure in &failed_chunks {
            warn!(chunk_number = failure.chunk_number, error = %failure.error, "Staged chunk failed verification");
        }

        BatchVerificationSummary {
            total: chunks.len(),
            passed: chunks.len() - failed_chunks.len(),
            failed: failed_chunks.len(),
            failed_chunks,
        }
    }
}
