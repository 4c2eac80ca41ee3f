use crate::metadata::error::{MetadataError, MetadataResult};
use crate::metadata::keys::ensure_database_key;
use crate::metadata::schema::create_schema;
use crate::metadata::types::{FileInfo, MessageRef, StorageStats};
use crate::metrics;
use crate::secret::SecretStore;
use parking_lot::RwLock;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transactional bookkeeping for files, chunked uploads and downloads.
///
/// Lifecycle: [`new`](Self::new) → [`initialize`](Self::initialize) → use →
/// [`close`](Self::close). Every operation on a store that is not open fails
/// with [`MetadataError::StoreUnavailable`]. Callers get copies of rows and
/// change state only through these methods.
pub struct MetadataDatabase {
    secrets: Arc<SecretStore>,
    allow_unencrypted: bool,
    pool: RwLock<Option<SqlitePool>>,
}

impl MetadataDatabase {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self {
            secrets,
            allow_unencrypted: false,
            pool: RwLock::new(None),
        }
    }

    /// Accept a SQLite build without page encryption. The key is still
    /// generated and applied, but the file on disk is plain SQLite.
    pub fn allow_unencrypted(mut self) -> Self {
        self.allow_unencrypted = true;
        self
    }

    /// Construct and initialize in one step. Fails with
    /// [`MetadataError::EncryptionUnavailable`] on a build without SQLCipher.
    pub async fn open(path: impl AsRef<Path>, secrets: Arc<SecretStore>) -> MetadataResult<Self> {
        let db = Self::new(secrets);
        db.initialize(path).await?;
        Ok(db)
    }

    /// Open the store at `path`, apply the encryption key, verify it and
    /// create or migrate the schema. Re-initializing replaces the open pool.
    ///
    /// Fails unless the linked SQLite applies page encryption, or
    /// [`allow_unencrypted`](Self::allow_unencrypted) was set.
    pub async fn initialize(&self, path: impl AsRef<Path>) -> MetadataResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let key = ensure_database_key(&self.secrets)?;

        // sqlx emits `key` before every other pragma.
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("key", key.pragma_value())
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: multi-statement transactions never race a second
        // writer for the read-to-write lock upgrade.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(key_rejected_or)?;

        if let Err(e) = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM sqlite_master")
            .fetch_one(&pool)
            .await
        {
            pool.close().await;
            return Err(MetadataError::InvalidKey(format!(
                "store rejected the key or is corrupt: {e}"
            )));
        }

        // Plain SQLite ignores `PRAGMA key` and has no `cipher_version`.
        let cipher = match sqlx::query_scalar::<_, String>("PRAGMA cipher_version")
            .fetch_optional(&pool)
            .await
        {
            Ok(cipher) => cipher,
            Err(e) => {
                pool.close().await;
                return Err(e.into());
            }
        };
        match cipher {
            Some(version) => debug!(cipher_version = %version, "Page encryption active"),
            None if self.allow_unencrypted => warn!(
                path = %path.display(),
                "SQLite build has no page encryption; metadata store is NOT encrypted at rest"
            ),
            None => {
                pool.close().await;
                return Err(MetadataError::EncryptionUnavailable);
            }
        }

        {
            let mut conn = pool.acquire().await?;
            create_schema(&mut conn).await?;
        }

        let previous = self.pool.write().replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }

        info!(path = %path.display(), "Metadata store initialized");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.pool.read().is_some()
    }

    pub async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("Metadata store closed");
        }
    }

    pub(crate) fn pool(&self) -> MetadataResult<SqlitePool> {
        self.pool
            .read()
            .clone()
            .ok_or(MetadataError::StoreUnavailable)
    }

    pub(crate) async fn begin(&self) -> MetadataResult<Transaction<'static, Sqlite>> {
        Ok(self.pool()?.begin().await?)
    }

    // ── Files ────────────────────────────────────────────────────────────────

    pub async fn insert_file(&self, file: &FileInfo) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files
            (file_id, file_name, file_size, mime_type, category, upload_date,
             message_id, telegram_file_id, uploader_bot_token, is_encrypted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.file_name)
        .bind(size_to_sql("file_size", file.file_size)?)
        .bind(&file.mime_type)
        .bind(&file.category)
        .bind(file.upload_date)
        .bind(file.message_id)
        .bind(&file.telegram_file_id)
        .bind(&file.uploader_bot_token)
        .bind(file.is_encrypted)
        .execute(&self.pool()?)
        .await?;

        debug!(file_id = %file.file_id, "Inserted file");
        Ok(())
    }

    /// Overwrite every column of an existing file. Returns false if absent.
    pub async fn update_file(&self, file: &FileInfo) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET
                file_name = ?, file_size = ?, mime_type = ?, category = ?, upload_date = ?,
                message_id = ?, telegram_file_id = ?, uploader_bot_token = ?, is_encrypted = ?
            WHERE file_id = ?
            "#,
        )
        .bind(&file.file_name)
        .bind(size_to_sql("file_size", file.file_size)?)
        .bind(&file.mime_type)
        .bind(&file.category)
        .bind(file.upload_date)
        .bind(file.message_id)
        .bind(&file.telegram_file_id)
        .bind(&file.uploader_bot_token)
        .bind(file.is_encrypted)
        .bind(&file.file_id)
        .execute(&self.pool()?)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileInfo>> {
        let row = sqlx::query("SELECT * FROM files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool()?)
            .await?;

        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn file_exists(&self, file_id: &str) -> MetadataResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&self.pool()?)
            .await?;
        Ok(count > 0)
    }

    /// Newest first, optionally restricted to one category.
    pub async fn list_files(&self, category: Option<&str>) -> MetadataResult<Vec<FileInfo>> {
        let pool = self.pool()?;
        let rows = match category {
            Some(category) => {
                sqlx::query(
                    "SELECT * FROM files WHERE category = ? ORDER BY upload_date DESC, file_id",
                )
                .bind(category)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM files ORDER BY upload_date DESC, file_id")
                    .fetch_all(&pool)
                    .await?
            }
        };

        rows.iter().map(file_from_row).collect()
    }

    /// Backend messages referencing `file_id`, chunk messages first. Read-only.
    pub async fn get_messages_to_delete(&self, file_id: &str) -> MetadataResult<Vec<MessageRef>> {
        let mut conn = self.pool()?.acquire().await?;
        collect_message_refs(&mut conn, file_id).await
    }

    /// Remove a file and all of its chunk rows in one transaction.
    ///
    /// Returns the backend messages that referenced it so the caller can
    /// delete them afterwards; the database does not depend on that cleanup.
    pub async fn delete_file(&self, file_id: &str) -> MetadataResult<Vec<MessageRef>> {
        let mut tx = self.begin().await?;
        let result = delete_file_in(&mut tx, file_id).await;
        let refs = finish(tx, "delete_file", result).await?;

        metrics::record_file_deleted(refs.len());
        info!(file_id, messages = refs.len(), "Deleted file");
        Ok(refs)
    }

    pub async fn total_bytes_stored(&self) -> MetadataResult<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(file_size), 0) FROM files")
            .fetch_one(&self.pool()?)
            .await?;
        size_from_sql("file_size", total)
    }

    pub async fn total_file_count(&self) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool()?)
            .await?;
        Ok(count as u64)
    }

    pub async fn storage_stats(&self) -> MetadataResult<StorageStats> {
        Ok(StorageStats {
            total_files: self.total_file_count().await?,
            total_bytes: self.total_bytes_stored().await?,
        })
    }
}

/// Commit on success, roll back on failure. Store failures are reported as
/// `TransactionAborted`; lookups and rejected transitions pass through as-is.
pub(crate) async fn finish<T>(
    tx: Transaction<'static, Sqlite>,
    operation: &'static str,
    result: MetadataResult<T>,
) -> MetadataResult<T> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| MetadataError::aborted(operation, e.into()))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(operation, error = %e, "Rollback failed");
            } else {
                debug!(operation, "Rolled back transaction");
            }
            match err {
                MetadataError::NotFound(_) | MetadataError::InvalidTransition(_) => Err(err),
                other => {
                    warn!(operation, error = %other, "Transaction aborted");
                    Err(MetadataError::aborted(operation, other))
                }
            }
        }
    }
}

async fn collect_message_refs(
    conn: &mut SqliteConnection,
    file_id: &str,
) -> MetadataResult<Vec<MessageRef>> {
    let chunk_rows = sqlx::query(
        r#"
        SELECT message_id, uploader_bot_token FROM file_chunks
        WHERE file_id = ? AND message_id IS NOT NULL
        ORDER BY chunk_number
        "#,
    )
    .bind(file_id)
    .fetch_all(&mut *conn)
    .await?;

    let file_row = sqlx::query(
        "SELECT message_id, uploader_bot_token FROM files WHERE file_id = ? AND message_id IS NOT NULL",
    )
    .bind(file_id)
    .fetch_optional(&mut *conn)
    .await?;

    let mut refs: Vec<MessageRef> = Vec::with_capacity(chunk_rows.len() + 1);
    for row in chunk_rows.iter().chain(file_row.iter()) {
        let message = MessageRef {
            message_id: row.try_get("message_id")?,
            uploader_bot_token: row.try_get("uploader_bot_token")?,
        };
        if !refs.contains(&message) {
            refs.push(message);
        }
    }
    Ok(refs)
}

async fn delete_file_in(
    conn: &mut SqliteConnection,
    file_id: &str,
) -> MetadataResult<Vec<MessageRef>> {
    let refs = collect_message_refs(conn, file_id).await?;

    // Chunk rows go with their parent through ON DELETE CASCADE.
    let chunked = sqlx::query("DELETE FROM chunked_files WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut *conn)
        .await?;

    let direct = sqlx::query("DELETE FROM files WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut *conn)
        .await?;

    if chunked.rows_affected() == 0 && direct.rows_affected() == 0 {
        return Err(MetadataError::NotFound(format!("file {file_id}")));
    }
    Ok(refs)
}

/// With a wrong key the first pragma after `key` already fails with
/// SQLITE_NOTADB, before the `sqlite_master` check runs.
fn key_rejected_or(err: sqlx::Error) -> MetadataError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("26") || db.message().contains("file is not a database") {
            return MetadataError::InvalidKey(format!("store rejected the key: {}", db.message()));
        }
    }
    err.into()
}

/// SQLite integers are signed; sizes past `i64::MAX` are refused rather than
/// wrapped.
pub(crate) fn size_to_sql(column: &'static str, value: u64) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| {
        MetadataError::IntegrityViolation(format!("{column} {value} exceeds the storable range"))
    })
}

pub(crate) fn size_from_sql(column: &'static str, value: i64) -> MetadataResult<u64> {
    u64::try_from(value)
        .map_err(|_| MetadataError::IntegrityViolation(format!("{column} is negative: {value}")))
}

pub(crate) fn parse_status<S>(raw: &str) -> MetadataResult<S>
where
    S: FromStr<Err = crate::transfer::TransitionError>,
{
    raw.parse()
        .map_err(|e: crate::transfer::TransitionError| MetadataError::Statement(e.to_string()))
}

fn file_from_row(row: &SqliteRow) -> MetadataResult<FileInfo> {
    Ok(FileInfo {
        file_id: row.try_get("file_id")?,
        file_name: row.try_get("file_name")?,
        file_size: size_from_sql("file_size", row.try_get("file_size")?)?,
        mime_type: row.try_get("mime_type")?,
        category: row.try_get("category")?,
        upload_date: row.try_get("upload_date")?,
        message_id: row.try_get("message_id")?,
        telegram_file_id: row.try_get("telegram_file_id")?,
        uploader_bot_token: row.try_get("uploader_bot_token")?,
        is_encrypted: row.try_get("is_encrypted")?,
    })
}
