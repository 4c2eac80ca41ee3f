pub mod error;
pub mod state_machine;
pub mod types;

pub use error::{TransitionError, TransitionResult};
pub use state_machine::{
    aggregate_download_status, aggregate_file_status, token_for_chunk, ChunkEvent, FileEvent,
};
pub use types::{ChunkStatus, DownloadStatus, FileStatus, ResumeInfo, RetryPolicy};
