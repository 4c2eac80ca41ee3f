//! Transition rules shared by the metadata store and transfer workers.
//!
//! ```text
//! pending --claim--> uploading --ack--> completed
//! uploading --fail--> error --claim (retry < max)--> uploading
//! error --claim (retries exhausted)--> rejected, error is terminal
//! pending|uploading --cancel--> canceled (file level)
//! ```
//!
//! The SQL in `metadata` encodes the chunk rules as conditional updates.
//! File and download status changes go through the functions here.

use crate::transfer::error::{TransitionError, TransitionResult};
use crate::transfer::types::{ChunkStatus, DownloadStatus, FileStatus, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A worker takes the chunk.
    Claim,
    /// The backend acknowledged the transfer.
    Ack,
    /// The backend call failed or timed out.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Start,
    AllChunksCompleted,
    RetriesExhausted,
    Cancel,
}

fn invalid<T: std::fmt::Display, U: std::fmt::Display>(from: T, to: U) -> TransitionError {
    TransitionError::Invalid {
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl ChunkStatus {
    /// Next status for `event`, given how often the chunk has already failed.
    pub fn apply(
        self,
        event: ChunkEvent,
        retry_count: u32,
        policy: &RetryPolicy,
    ) -> TransitionResult<ChunkStatus> {
        match (self, event) {
            (ChunkStatus::Pending, ChunkEvent::Claim) => Ok(ChunkStatus::Uploading),
            (ChunkStatus::Error, ChunkEvent::Claim) => {
                if policy.can_retry(retry_count) {
                    Ok(ChunkStatus::Uploading)
                } else {
                    Err(TransitionError::RetriesExhausted { retry_count })
                }
            }
            (ChunkStatus::Uploading, ChunkEvent::Ack) => Ok(ChunkStatus::Completed),
            (ChunkStatus::Uploading, ChunkEvent::Fail) => Ok(ChunkStatus::Error),
            (from, ChunkEvent::Claim) => Err(invalid(from, ChunkStatus::Uploading)),
            (from, ChunkEvent::Ack) => Err(invalid(from, ChunkStatus::Completed)),
            (from, ChunkEvent::Fail) => Err(invalid(from, ChunkStatus::Error)),
        }
    }

    /// Whether the chunk can never change again under `policy`.
    pub fn is_terminal(self, retry_count: u32, policy: &RetryPolicy) -> bool {
        match self {
            ChunkStatus::Completed => true,
            ChunkStatus::Error => !policy.can_retry(retry_count),
            _ => false,
        }
    }
}

impl FileStatus {
    pub fn apply(self, event: FileEvent) -> TransitionResult<FileStatus> {
        let next = match event {
            FileEvent::Start => FileStatus::Uploading,
            FileEvent::AllChunksCompleted => FileStatus::Completed,
            FileEvent::RetriesExhausted => FileStatus::Error,
            FileEvent::Cancel => FileStatus::Canceled,
        };
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(invalid(self, next))
        }
    }

    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Uploading)
                    | (Pending, Canceled)
                    | (Pending, Error)
                    | (Uploading, Completed)
                    | (Uploading, Error)
                    | (Uploading, Canceled)
            )
    }
}

impl DownloadStatus {
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Downloading)
                    | (Pending, Canceled)
                    | (Pending, Error)
                    | (Downloading, Completed)
                    | (Downloading, Error)
                    | (Downloading, Canceled)
            )
    }
}

/// Derive a chunked file's status from its chunk counts.
///
/// Completion requires every chunk to be completed; a single exhausted chunk
/// makes the file fail. Terminal states are sticky. A pending file whose
/// chunks are all done is started first, so every step is a legal transition.
pub fn aggregate_file_status(
    current: FileStatus,
    total_chunks: u32,
    completed_chunks: u32,
    exhausted_chunks: u32,
) -> FileStatus {
    let event = if total_chunks > 0 && completed_chunks >= total_chunks {
        FileEvent::AllChunksCompleted
    } else if exhausted_chunks > 0 {
        FileEvent::RetriesExhausted
    } else {
        return current;
    };

    let from = match (current, event) {
        (FileStatus::Pending, FileEvent::AllChunksCompleted) => {
            current.apply(FileEvent::Start).unwrap_or(current)
        }
        _ => current,
    };
    from.apply(event).unwrap_or(current)
}

/// Download counterpart of [`aggregate_file_status`].
pub fn aggregate_download_status(
    current: DownloadStatus,
    total_chunks: u32,
    completed_chunks: u32,
    exhausted_chunks: u32,
) -> DownloadStatus {
    let next = if total_chunks > 0 && completed_chunks >= total_chunks {
        DownloadStatus::Completed
    } else if exhausted_chunks > 0 {
        DownloadStatus::Error
    } else {
        return current;
    };

    let from = match (current, next) {
        (DownloadStatus::Pending, DownloadStatus::Completed) => DownloadStatus::Downloading,
        _ => current,
    };
    if from.can_transition_to(next) {
        next
    } else {
        current
    }
}

/// Round-robin credential for a chunk: `tokens[chunk_number % len]`.
/// Stable across restarts as long as the token list is unchanged.
pub fn token_for_chunk(tokens: &[String], chunk_number: u32) -> Option<&str> {
    if tokens.is_empty() {
        return None;
    }
    Some(tokens[chunk_number as usize % tokens.len()].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let policy = RetryPolicy::new(3);
        let status = ChunkStatus::Pending
            .apply(ChunkEvent::Claim, 0, &policy)
            .unwrap();
        assert_eq!(status, ChunkStatus::Uploading);
        assert_eq!(
            status.apply(ChunkEvent::Ack, 0, &policy).unwrap(),
            ChunkStatus::Completed
        );
    }

    #[test]
    fn test_retry_until_exhausted() {
        let policy = RetryPolicy::new(2);
        assert!(ChunkStatus::Error.apply(ChunkEvent::Claim, 1, &policy).is_ok());
        assert_eq!(
            ChunkStatus::Error.apply(ChunkEvent::Claim, 2, &policy),
            Err(TransitionError::RetriesExhausted { retry_count: 2 })
        );
        assert!(ChunkStatus::Error.is_terminal(2, &policy));
        assert!(!ChunkStatus::Error.is_terminal(1, &policy));
    }

    #[test]
    fn test_completed_only_once() {
        let policy = RetryPolicy::default();
        assert!(ChunkStatus::Completed
            .apply(ChunkEvent::Ack, 0, &policy)
            .is_err());
        assert!(ChunkStatus::Completed
            .apply(ChunkEvent::Claim, 0, &policy)
            .is_err());
        assert!(ChunkStatus::Pending.apply(ChunkEvent::Ack, 0, &policy).is_err());
    }

    #[test]
    fn test_zero_retries_means_first_failure_is_final() {
        let policy = RetryPolicy::new(0);
        assert!(ChunkStatus::Pending.apply(ChunkEvent::Claim, 0, &policy).is_ok());
        assert!(ChunkStatus::Error.apply(ChunkEvent::Claim, 0, &policy).is_err());
        assert!(ChunkStatus::Error.is_terminal(1, &policy));
    }

    #[test]
    fn test_file_transitions() {
        assert_eq!(
            FileStatus::Pending.apply(FileEvent::Start).unwrap(),
            FileStatus::Uploading
        );
        assert_eq!(
            FileStatus::Uploading.apply(FileEvent::Cancel).unwrap(),
            FileStatus::Canceled
        );
        assert!(FileStatus::Canceled.apply(FileEvent::Start).is_err());
        assert!(FileStatus::Completed.apply(FileEvent::Cancel).is_err());
        assert!(FileStatus::Pending
            .apply(FileEvent::AllChunksCompleted)
            .is_err());
    }

    #[test]
    fn test_aggregate_status() {
        use FileStatus::*;
        assert_eq!(aggregate_file_status(Uploading, 4, 4, 0), Completed);
        assert_eq!(aggregate_file_status(Uploading, 4, 3, 1), Error);
        assert_eq!(aggregate_file_status(Uploading, 4, 3, 0), Uploading);
        assert_eq!(aggregate_file_status(Canceled, 4, 4, 0), Canceled);
        assert_eq!(aggregate_file_status(Completed, 4, 4, 1), Completed);
        assert_eq!(aggregate_file_status(Error, 4, 4, 0), Error);
    }

    #[test]
    fn test_aggregate_from_pending() {
        use FileStatus::*;
        assert_eq!(aggregate_file_status(Pending, 2, 2, 0), Completed);
        assert_eq!(aggregate_file_status(Pending, 2, 0, 1), Error);
        assert_eq!(aggregate_file_status(Pending, 2, 1, 0), Pending);
        assert_eq!(
            aggregate_download_status(DownloadStatus::Pending, 2, 2, 0),
            DownloadStatus::Completed
        );
    }

    #[test]
    fn test_status_strings() {
        for status in [
            FileStatus::Pending,
            FileStatus::Uploading,
            FileStatus::Completed,
            FileStatus::Error,
            FileStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("done".parse::<ChunkStatus>().is_err());
        assert_eq!(
            "downloading".parse::<DownloadStatus>().unwrap(),
            DownloadStatus::Downloading
        );
    }

    #[test]
    fn test_download_aggregate_is_sticky_when_canceled() {
        assert_eq!(
            aggregate_download_status(DownloadStatus::Downloading, 2, 2, 0),
            DownloadStatus::Completed
        );
        assert_eq!(
            aggregate_download_status(DownloadStatus::Canceled, 2, 2, 0),
            DownloadStatus::Canceled
        );
        assert_eq!(
            aggregate_download_status(DownloadStatus::Downloading, 2, 1, 1),
            DownloadStatus::Error
        );
    }

    #[test]
    fn test_token_round_robin() {
        let tokens = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let picked: Vec<_> = (0..5).filter_map(|n| token_for_chunk(&tokens, n)).collect();
        assert_eq!(picked, ["a", "b", "c", "a", "b"]);
        assert_eq!(token_for_chunk(&[], 7), None);
    }
}
