use crate::transfer::{ChunkStatus, DownloadStatus, FileStatus};
use serde::{Deserialize, Serialize};

/// A file uploaded in one piece.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub category: Option<String>,
    pub upload_date: i64,
    /// Locator of the message holding the blob in the backend.
    pub message_id: Option<i64>,
    /// Blob handle assigned by the backend.
    pub telegram_file_id: Option<String>,
    /// Credential that owns the blob.
    pub uploader_bot_token: Option<String>,
    pub is_encrypted: bool,
}

impl FileInfo {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_size,
            mime_type: None,
            category: None,
            upload_date: chrono::Utc::now().timestamp(),
            message_id: None,
            telegram_file_id: None,
            uploader_bot_token: None,
            is_encrypted: false,
        }
    }
}

/// Parent record of a multi-part upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkedFileInfo {
    pub file_id: String,
    pub original_filename: String,
    pub mime_type: Option<String>,
    pub total_size: u64,
    pub total_chunks: u32,
    /// Always equals the number of chunk rows in `completed`.
    pub completed_chunks: u32,
    pub status: FileStatus,
    /// Whole-file hash computed before chunking.
    pub original_file_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChunkedFileInfo {
    pub fn new(
        file_id: impl Into<String>,
        original_filename: impl Into<String>,
        total_size: u64,
        total_chunks: u32,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            file_id: file_id.into(),
            original_filename: original_filename.into(),
            mime_type: None,
            total_size,
            total_chunks,
            completed_chunks: 0,
            status: FileStatus::Pending,
            original_file_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        (self.completed_chunks as f32 / self.total_chunks as f32) * 100.0
    }
}

/// One slice of a chunked upload, keyed by `(file_id, chunk_number)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub file_id: String,
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub chunk_hash: Option<String>,
    pub telegram_file_id: Option<String>,
    pub message_id: Option<i64>,
    pub uploader_bot_token: Option<String>,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl ChunkInfo {
    pub fn new(
        file_id: impl Into<String>,
        chunk_number: u32,
        total_chunks: u32,
        chunk_size: u64,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            chunk_number,
            total_chunks,
            chunk_size,
            chunk_hash: None,
            telegram_file_id: None,
            message_id: None,
            uploader_bot_token: None,
            status: ChunkStatus::Pending,
            retry_count: 0,
            error_message: None,
        }
    }

    pub fn with_hash(mut self, chunk_hash: impl Into<String>) -> Self {
        self.chunk_hash = Some(chunk_hash.into());
        self
    }
}

/// Where a blob lives in the backend, as reported by a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobLocator {
    pub message_id: i64,
    pub telegram_file_id: String,
    pub uploader_bot_token: String,
}

/// A backend message that must be deleted when its file is removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub message_id: i64,
    /// `None` for rows written before the owning credential was recorded.
    pub uploader_bot_token: Option<String>,
}

/// Counters after a chunk changed state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkProgress {
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub status: FileStatus,
}

impl ChunkProgress {
    pub fn is_complete(&self) -> bool {
        self.status == FileStatus::Completed
    }
}

/// Outcome of recording a failed chunk attempt. `status` is the parent's
/// status afterwards: a [`FileStatus`] for uploads, a [`DownloadStatus`] for
/// downloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkFailure<S = FileStatus> {
    pub retry_count: u32,
    /// The retry ceiling was reached; the chunk will not be claimed again.
    pub exhausted: bool,
    pub status: S,
}

/// Parent record of a download being reassembled from chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadInfo {
    pub download_id: String,
    pub file_id: String,
    pub file_name: String,
    pub target_path: String,
    /// Staging directory holding partial chunks.
    pub temp_dir: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub status: DownloadStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DownloadInfo {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        target_path: impl Into<String>,
        temp_dir: impl Into<String>,
        total_size: u64,
        total_chunks: u32,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            download_id: uuid::Uuid::new_v4().to_string(),
            file_id: file_id.into(),
            file_name: file_name.into(),
            target_path: target_path.into(),
            temp_dir: temp_dir.into(),
            total_size,
            total_chunks,
            completed_chunks: 0,
            status: DownloadStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadChunkInfo {
    pub download_id: String,
    pub chunk_number: u32,
    pub chunk_size: u64,
    pub chunk_hash: Option<String>,
    pub telegram_file_id: String,
    pub bot_token: Option<String>,
    /// Staged chunk file once downloaded.
    pub temp_path: Option<String>,
    pub status: DownloadStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl DownloadChunkInfo {
    pub fn new(
        download_id: impl Into<String>,
        chunk_number: u32,
        chunk_size: u64,
        telegram_file_id: impl Into<String>,
    ) -> Self {
        Self {
            download_id: download_id.into(),
            chunk_number,
            chunk_size,
            chunk_hash: None,
            telegram_file_id: telegram_file_id.into(),
            bot_token: None,
            temp_path: None,
            status: DownloadStatus::Pending,
            retry_count: 0,
            error_message: None,
        }
    }
}

/// Download counterpart of [`ChunkProgress`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadProgress {
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub status: DownloadStatus,
}

/// Aggregates over the `files` table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_bytes: u64,
}
