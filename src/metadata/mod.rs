pub mod chunks;
pub mod database;
pub mod downloads;
pub mod error;
pub mod keys;
pub mod schema;
pub mod types;

pub use database::MetadataDatabase;
pub use error::{MetadataError, MetadataResult};
pub use keys::{ensure_database_key, DatabaseKey, DB_KEY_NAME};
pub use types::{
    BlobLocator, ChunkFailure, ChunkInfo, ChunkProgress, ChunkedFileInfo, DownloadChunkInfo,
    DownloadInfo, DownloadProgress, FileInfo, MessageRef, StorageStats,
};
