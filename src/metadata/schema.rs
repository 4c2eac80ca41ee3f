//! Table definitions and additive migrations.

use crate::metadata::error::MetadataResult;
use sqlx::SqliteConnection;
use tracing::debug;

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        file_id TEXT PRIMARY KEY,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        mime_type TEXT,
        category TEXT,
        upload_date INTEGER NOT NULL,
        message_id INTEGER,
        telegram_file_id TEXT,
        uploader_bot_token TEXT,
        is_encrypted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunked_files (
        file_id TEXT PRIMARY KEY,
        original_filename TEXT NOT NULL,
        mime_type TEXT,
        total_size INTEGER NOT NULL,
        total_chunks INTEGER NOT NULL CHECK (total_chunks > 0),
        completed_chunks INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        original_file_hash TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id TEXT NOT NULL REFERENCES chunked_files(file_id) ON DELETE CASCADE,
        chunk_number INTEGER NOT NULL CHECK (chunk_number >= 0),
        total_chunks INTEGER NOT NULL,
        chunk_size INTEGER NOT NULL,
        chunk_hash TEXT,
        telegram_file_id TEXT,
        message_id INTEGER,
        uploader_bot_token TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        updated_at INTEGER NOT NULL,
        UNIQUE (file_id, chunk_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS downloads (
        download_id TEXT PRIMARY KEY,
        file_id TEXT NOT NULL,
        file_name TEXT NOT NULL,
        target_path TEXT NOT NULL,
        temp_dir TEXT NOT NULL,
        total_size INTEGER NOT NULL,
        total_chunks INTEGER NOT NULL CHECK (total_chunks > 0),
        completed_chunks INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS download_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        download_id TEXT NOT NULL REFERENCES downloads(download_id) ON DELETE CASCADE,
        chunk_number INTEGER NOT NULL CHECK (chunk_number >= 0),
        chunk_size INTEGER NOT NULL,
        chunk_hash TEXT,
        telegram_file_id TEXT NOT NULL,
        bot_token TEXT,
        temp_path TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        updated_at INTEGER NOT NULL,
        UNIQUE (download_id, chunk_number)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_file_chunks_status ON file_chunks(file_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_chunked_files_status ON chunked_files(status)",
    "CREATE INDEX IF NOT EXISTS idx_download_chunks_status ON download_chunks(download_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_files_category ON files(category)",
];

/// Columns added after the first release. Fresh databases already have them
/// from `CREATE_TABLES`, so "duplicate column" is the expected outcome there.
const ADDITIVE_MIGRATIONS: &[&str] = &[
    "ALTER TABLE files ADD COLUMN is_encrypted INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE files ADD COLUMN uploader_bot_token TEXT",
    "ALTER TABLE file_chunks ADD COLUMN uploader_bot_token TEXT",
    "ALTER TABLE chunked_files ADD COLUMN original_file_hash TEXT",
    "ALTER TABLE download_chunks ADD COLUMN bot_token TEXT",
];

/// Create every table and index, then apply the additive column migrations.
/// Safe to run on every start.
pub async fn create_schema(conn: &mut SqliteConnection) -> MetadataResult<()> {
    for statement in CREATE_TABLES {
        sqlx::query(statement).execute(&mut *conn).await?;
    }

    for statement in ADDITIVE_MIGRATIONS {
        match sqlx::query(statement).execute(&mut *conn).await {
            Ok(_) => debug!(statement, "Applied schema migration"),
            Err(e) if is_duplicate_column(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn is_duplicate_column(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("duplicate column name"),
        _ => false,
    }
}
