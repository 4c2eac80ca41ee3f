//! Setting names and compiled defaults.

pub const API_ID: &str = "API_ID";
pub const API_HASH: &str = "API_HASH";
pub const BOT_TOKEN: &str = "BOT_TOKEN";
pub const CHANNEL_ID: &str = "CHANNEL_ID";
/// Comma-separated extra credentials for round-robin uploads.
pub const ADDITIONAL_BOT_TOKENS: &str = "ADDITIONAL_BOT_TOKENS";
pub const CHUNK_SIZE: &str = "CHUNK_SIZE";
pub const CHUNK_THRESHOLD: &str = "CHUNK_THRESHOLD";
pub const MAX_RETRIES: &str = "MAX_RETRIES";
pub const API_PORT: &str = "API_PORT";
pub const API_HOST: &str = "API_HOST";
pub const DB_PATH: &str = "DB_PATH";
pub const LOG_LEVEL: &str = "LOG_LEVEL";
pub const LOG_PATH: &str = "LOG_PATH";

/// Every setting the resolver looks up, in resolution order.
pub const SETTINGS: &[&str] = &[
    API_ID,
    API_HASH,
    BOT_TOKEN,
    CHANNEL_ID,
    ADDITIONAL_BOT_TOKENS,
    CHUNK_SIZE,
    CHUNK_THRESHOLD,
    MAX_RETRIES,
    API_PORT,
    API_HOST,
    DB_PATH,
    LOG_LEVEL,
    LOG_PATH,
];

/// Slightly under the backend's 20 MiB bot upload limit.
pub const DEFAULT_CHUNK_SIZE: u64 = 19 * 1024 * 1024;
/// Files at or above this size are uploaded in chunks.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_DB_PATH: &str = "data/metadata.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";
