use crate::transfer::error::TransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upload state of a single chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Uploading => "uploading",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Error => "error",
        }
    }
}

impl FromStr for ChunkStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "uploading" => Ok(ChunkStatus::Uploading),
            "completed" => Ok(ChunkStatus::Completed),
            "error" => Ok(ChunkStatus::Error),
            other => Err(TransitionError::UnknownStatus(other.to_string())),
        }
    }
}

/// Overall state of a chunked upload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Canceled,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        FileStatus::Pending,
        FileStatus::Uploading,
        FileStatus::Completed,
        FileStatus::Error,
        FileStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
            FileStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Error | FileStatus::Canceled
        )
    }
}

impl FromStr for FileStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "uploading" => Ok(FileStatus::Uploading),
            "completed" => Ok(FileStatus::Completed),
            "error" => Ok(FileStatus::Error),
            "canceled" => Ok(FileStatus::Canceled),
            other => Err(TransitionError::UnknownStatus(other.to_string())),
        }
    }
}

/// State of a download and of each of its chunks. Chunks never use `Canceled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Error,
    Canceled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Error | DownloadStatus::Canceled
        )
    }
}

impl FromStr for DownloadStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "error" => Ok(DownloadStatus::Error),
            "canceled" => Ok(DownloadStatus::Canceled),
            other => Err(TransitionError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bound on chunk retries. The store only records `retry_count`;
/// callers pass the policy in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Snapshot used to decide whether and how a chunked upload can continue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeInfo {
    pub file_id: String,
    pub status: FileStatus,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    /// Pending chunks plus failed chunks still under the retry ceiling.
    pub retryable_chunks: u32,
    pub in_flight_chunks: u32,
    pub exhausted_chunks: u32,
    pub progress_percent: f32,
    pub can_resume: bool,
}

impl ResumeInfo {
    pub fn remaining_chunks(&self) -> u32 {
        self.total_chunks.saturating_sub(self.completed_chunks)
    }
}
