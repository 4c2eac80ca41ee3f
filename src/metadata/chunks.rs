//! Chunked uploads: parent rows in `chunked_files`, slices in `file_chunks`.
//!
//! Claims are single conditional `UPDATE … RETURNING` statements, so two
//! workers can never both move the same chunk out of `pending`. Every state
//! change recounts `completed_chunks` from the chunk rows inside the same
//! transaction.

use crate::metadata::database::{
    finish, parse_status, size_from_sql, size_to_sql, MetadataDatabase,
};
use crate::metadata::error::{MetadataError, MetadataResult};
use crate::metadata::types::{BlobLocator, ChunkFailure, ChunkInfo, ChunkProgress, ChunkedFileInfo};
use crate::metrics;
use crate::transfer::{
    aggregate_file_status, ChunkEvent, ChunkStatus, FileStatus, ResumeInfo, RetryPolicy,
    TransitionError,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl MetadataDatabase {
    /// Insert a chunked file and its chunk rows atomically.
    ///
    /// Rows may arrive in any state; the file status is derived from them, so
    /// a chunk registered with its retries already used up fails the file.
    pub async fn register_chunked_file(
        &self,
        file: &ChunkedFileInfo,
        chunks: &[ChunkInfo],
        policy: &RetryPolicy,
    ) -> MetadataResult<ChunkProgress> {
        if let Some(stray) = chunks.iter().find(|c| c.file_id != file.file_id) {
            return Err(MetadataError::IntegrityViolation(format!(
                "chunk {} belongs to {}, not {}",
                stray.chunk_number, stray.file_id, file.file_id
            )));
        }
        if let Some(outside) = chunks.iter().find(|c| c.chunk_number >= file.total_chunks) {
            return Err(MetadataError::IntegrityViolation(format!(
                "chunk number {} outside 0..{}",
                outside.chunk_number, file.total_chunks
            )));
        }

        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            insert_chunked_file_in(&mut tx, file).await?;
            for chunk in chunks {
                insert_chunk_in(&mut tx, chunk).await?;
            }
            refresh_progress(&mut tx, &file.file_id, Some(policy)).await
        }
        .await;
        let progress = finish(tx, "register_chunked_file", result).await?;

        info!(
            file_id = %file.file_id,
            total_chunks = file.total_chunks,
            registered = chunks.len(),
            "Registered chunked file"
        );
        Ok(progress)
    }

    pub async fn insert_chunked_file(&self, file: &ChunkedFileInfo) -> MetadataResult<()> {
        let mut conn = self.pool()?.acquire().await?;
        insert_chunked_file_in(&mut conn, file).await
    }

    pub async fn get_chunked_file(&self, file_id: &str) -> MetadataResult<Option<ChunkedFileInfo>> {
        let mut conn = self.pool()?.acquire().await?;
        fetch_chunked_file(&mut conn, file_id).await
    }

    /// Oldest first, optionally filtered by status.
    pub async fn list_chunked_files(
        &self,
        status: Option<FileStatus>,
    ) -> MetadataResult<Vec<ChunkedFileInfo>> {
        let pool = self.pool()?;
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM chunked_files WHERE status = ? ORDER BY created_at, file_id",
                )
                .bind(status.as_str())
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM chunked_files ORDER BY created_at, file_id")
                    .fetch_all(&pool)
                    .await?
            }
        };

        rows.iter().map(chunked_file_from_row).collect()
    }

    /// Rewrite descriptive columns. Status and counters only change through
    /// the transfer operations below. Returns whether a row matched.
    pub async fn update_chunked_file(&self, file: &ChunkedFileInfo) -> MetadataResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE chunked_files SET
                original_filename = ?, mime_type = ?, total_size = ?,
                original_file_hash = ?, updated_at = ?
            WHERE file_id = ?
            "#,
        )
        .bind(&file.original_filename)
        .bind(&file.mime_type)
        .bind(size_to_sql("total_size", file.total_size)?)
        .bind(&file.original_file_hash)
        .bind(now())
        .bind(&file.file_id)
        .execute(&self.pool()?)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Move a chunked file to `next` if the state model allows it.
    /// `completed` is only accepted once every chunk is completed.
    pub async fn update_chunked_file_status(
        &self,
        file_id: &str,
        next: FileStatus,
    ) -> MetadataResult<FileStatus> {
        let mut tx = self.begin().await?;
        let result = set_file_status_in(&mut tx, file_id, next).await;
        finish(tx, "update_chunked_file_status", result).await
    }

    /// Stop a pending or running upload. In-flight workers are not interrupted;
    /// they find the file canceled on their next claim.
    pub async fn cancel_chunked_file(&self, file_id: &str) -> MetadataResult<FileStatus> {
        let status = self
            .update_chunked_file_status(file_id, FileStatus::Canceled)
            .await?;
        info!(file_id, "Canceled chunked file");
        Ok(status)
    }

    /// Insert one chunk row. A duplicate `(file_id, chunk_number)` is an
    /// integrity violation.
    pub async fn insert_chunk(
        &self,
        chunk: &ChunkInfo,
        policy: &RetryPolicy,
    ) -> MetadataResult<ChunkProgress> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            insert_chunk_in(&mut tx, chunk).await?;
            refresh_progress(&mut tx, &chunk.file_id, Some(policy)).await
        }
        .await;
        finish(tx, "insert_chunk", result).await
    }

    pub async fn get_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
    ) -> MetadataResult<Option<ChunkInfo>> {
        let mut conn = self.pool()?.acquire().await?;
        fetch_chunk(&mut conn, file_id, chunk_number).await
    }

    /// All chunks of a file ordered by chunk number.
    pub async fn get_chunks(&self, file_id: &str) -> MetadataResult<Vec<ChunkInfo>> {
        let rows = sqlx::query("SELECT * FROM file_chunks WHERE file_id = ? ORDER BY chunk_number")
            .bind(file_id)
            .fetch_all(&self.pool()?)
            .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Rewrite a chunk's size and hash, e.g. after re-chunking a pending
    /// upload. Returns whether a row matched.
    pub async fn update_chunk(&self, chunk: &ChunkInfo) -> MetadataResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE file_chunks SET chunk_size = ?, chunk_hash = ?, updated_at = ?
            WHERE file_id = ? AND chunk_number = ?
            "#,
        )
        .bind(size_to_sql("chunk_size", chunk.chunk_size)?)
        .bind(&chunk.chunk_hash)
        .bind(now())
        .bind(&chunk.file_id)
        .bind(i64::from(chunk.chunk_number))
        .execute(&self.pool()?)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Claim one specific chunk for upload.
    ///
    /// Returns `None` when the chunk is not claimable: already taken or done,
    /// out of retries, or its file is no longer active.
    pub async fn claim_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
        policy: &RetryPolicy,
    ) -> MetadataResult<Option<ChunkInfo>> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let row = sqlx::query(
                r#"
                UPDATE file_chunks SET status = 'uploading', updated_at = ?
                WHERE file_id = ? AND chunk_number = ?
                  AND (status = 'pending' OR (status = 'error' AND retry_count < ?))
                  AND EXISTS (
                      SELECT 1 FROM chunked_files f
                      WHERE f.file_id = file_chunks.file_id
                        AND f.status IN ('pending', 'uploading')
                  )
                RETURNING *
                "#,
            )
            .bind(now())
            .bind(file_id)
            .bind(i64::from(chunk_number))
            .bind(i64::from(policy.max_retries))
            .fetch_optional(&mut *tx)
            .await?;

            after_claim(&mut tx, row).await
        }
        .await;
        finish(tx, "claim_chunk", result).await
    }

    /// Claim the lowest-numbered claimable chunk of a file.
    pub async fn claim_next_chunk(
        &self,
        file_id: &str,
        policy: &RetryPolicy,
    ) -> MetadataResult<Option<ChunkInfo>> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let row = sqlx::query(
                r#"
                UPDATE file_chunks SET status = 'uploading', updated_at = ?
                WHERE id = (
                    SELECT c.id FROM file_chunks c
                    JOIN chunked_files f ON f.file_id = c.file_id
                    WHERE c.file_id = ?
                      AND f.status IN ('pending', 'uploading')
                      AND (c.status = 'pending' OR (c.status = 'error' AND c.retry_count < ?))
                    ORDER BY c.chunk_number
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(now())
            .bind(file_id)
            .bind(i64::from(policy.max_retries))
            .fetch_optional(&mut *tx)
            .await?;

            after_claim(&mut tx, row).await
        }
        .await;
        finish(tx, "claim_next_chunk", result).await
    }

    /// Record a backend acknowledgement for a claimed chunk.
    pub async fn complete_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
        locator: &BlobLocator,
    ) -> MetadataResult<ChunkProgress> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let updated = sqlx::query(
                r#"
                UPDATE file_chunks SET
                    status = 'completed', telegram_file_id = ?, message_id = ?,
                    uploader_bot_token = ?, error_message = NULL, updated_at = ?
                WHERE file_id = ? AND chunk_number = ? AND status = 'uploading'
                "#,
            )
            .bind(&locator.telegram_file_id)
            .bind(locator.message_id)
            .bind(&locator.uploader_bot_token)
            .bind(now())
            .bind(file_id)
            .bind(i64::from(chunk_number))
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(rejected(&mut tx, file_id, chunk_number, ChunkEvent::Ack).await);
            }
            refresh_progress(&mut tx, file_id, None).await
        }
        .await;
        let progress = finish(tx, "complete_chunk", result).await?;

        metrics::record_chunk_completed();
        debug!(
            file_id,
            chunk_number,
            completed = progress.completed_chunks,
            total = progress.total_chunks,
            "Chunk completed"
        );
        Ok(progress)
    }

    /// Record a failed attempt on a claimed chunk. Once `retry_count` reaches
    /// the policy's ceiling the chunk stays in `error` and the file fails.
    pub async fn fail_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
        error_message: &str,
        policy: &RetryPolicy,
    ) -> MetadataResult<ChunkFailure> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let retry_count: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE file_chunks SET
                    status = 'error', retry_count = retry_count + 1,
                    error_message = ?, updated_at = ?
                WHERE file_id = ? AND chunk_number = ? AND status = 'uploading'
                RETURNING retry_count
                "#,
            )
            .bind(error_message)
            .bind(now())
            .bind(file_id)
            .bind(i64::from(chunk_number))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(retry_count) = retry_count else {
                return Err(rejected(&mut tx, file_id, chunk_number, ChunkEvent::Fail).await);
            };
            let retry_count = retry_count as u32;
            let exhausted = ChunkStatus::Error.is_terminal(retry_count, policy);
            let progress = refresh_progress(&mut tx, file_id, Some(policy)).await?;

            Ok(ChunkFailure {
                retry_count,
                exhausted,
                status: progress.status,
            })
        }
        .await;
        let failure = finish(tx, "fail_chunk", result).await?;

        metrics::record_chunk_failed(failure.exhausted);
        if failure.exhausted {
            warn!(file_id, chunk_number, retry_count = failure.retry_count, "Chunk retries exhausted");
        } else {
            debug!(file_id, chunk_number, retry_count = failure.retry_count, "Chunk failed");
        }
        Ok(failure)
    }

    /// Number of chunk rows in `completed`, counted from the rows themselves.
    pub async fn completed_chunk_count(&self, file_id: &str) -> MetadataResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM file_chunks WHERE file_id = ? AND status = 'completed'",
        )
        .bind(file_id)
        .fetch_one(&self.pool()?)
        .await?;
        Ok(count as u32)
    }

    pub async fn get_resume_info(
        &self,
        file_id: &str,
        policy: &RetryPolicy,
    ) -> MetadataResult<ResumeInfo> {
        let file = self
            .get_chunked_file(file_id)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("chunked file {file_id}")))?;

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'pending'
                                    OR (status = 'error' AND retry_count < ?) THEN 1 ELSE 0 END), 0) AS retryable,
                COALESCE(SUM(CASE WHEN status = 'uploading' THEN 1 ELSE 0 END), 0) AS in_flight,
                COALESCE(SUM(CASE WHEN status = 'error' AND retry_count >= ? THEN 1 ELSE 0 END), 0) AS exhausted
            FROM file_chunks WHERE file_id = ?
            "#,
        )
        .bind(i64::from(policy.max_retries))
        .bind(i64::from(policy.max_retries))
        .bind(file_id)
        .fetch_one(&self.pool()?)
        .await?;

        let completed = row.try_get::<i64, _>("completed")? as u32;
        let exhausted = row.try_get::<i64, _>("exhausted")? as u32;

        Ok(ResumeInfo {
            file_id: file.file_id.clone(),
            status: file.status,
            total_chunks: file.total_chunks,
            completed_chunks: completed,
            retryable_chunks: row.try_get::<i64, _>("retryable")? as u32,
            in_flight_chunks: row.try_get::<i64, _>("in_flight")? as u32,
            exhausted_chunks: exhausted,
            progress_percent: file.progress_percent(),
            can_resume: !file.status.is_terminal()
                && exhausted == 0
                && completed < file.total_chunks,
        })
    }

    /// Return chunks left in flight by a crashed worker to `pending`.
    /// Run once at startup, before any worker claims.
    pub async fn recover_interrupted(&self) -> MetadataResult<u64> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let uploads = sqlx::query(
                "UPDATE file_chunks SET status = 'pending', updated_at = ? WHERE status = 'uploading'",
            )
            .bind(now())
            .execute(&mut *tx)
            .await?;

            let downloads = sqlx::query(
                "UPDATE download_chunks SET status = 'pending', updated_at = ? WHERE status = 'downloading'",
            )
            .bind(now())
            .execute(&mut *tx)
            .await?;

            Ok(uploads.rows_affected() + downloads.rows_affected())
        }
        .await;
        let recovered = finish(tx, "recover_interrupted", result).await?;

        if recovered > 0 {
            info!(chunks = recovered, "Recovered interrupted chunk transfers");
        }
        Ok(recovered)
    }
}

async fn insert_chunked_file_in(
    conn: &mut SqliteConnection,
    file: &ChunkedFileInfo,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO chunked_files
        (file_id, original_filename, mime_type, total_size, total_chunks, completed_chunks,
         status, original_file_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&file.file_id)
    .bind(&file.original_filename)
    .bind(&file.mime_type)
    .bind(size_to_sql("total_size", file.total_size)?)
    .bind(i64::from(file.total_chunks))
    .bind(file.status.as_str())
    .bind(&file.original_file_hash)
    .bind(file.created_at)
    .bind(file.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_chunk_in(conn: &mut SqliteConnection, chunk: &ChunkInfo) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO file_chunks
        (file_id, chunk_number, total_chunks, chunk_size, chunk_hash, telegram_file_id,
         message_id, uploader_bot_token, status, retry_count, error_message, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.file_id)
    .bind(i64::from(chunk.chunk_number))
    .bind(i64::from(chunk.total_chunks))
    .bind(size_to_sql("chunk_size", chunk.chunk_size)?)
    .bind(&chunk.chunk_hash)
    .bind(&chunk.telegram_file_id)
    .bind(chunk.message_id)
    .bind(&chunk.uploader_bot_token)
    .bind(chunk.status.as_str())
    .bind(i64::from(chunk.retry_count))
    .bind(&chunk.error_message)
    .bind(now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_chunked_file(
    conn: &mut SqliteConnection,
    file_id: &str,
) -> MetadataResult<Option<ChunkedFileInfo>> {
    let row = sqlx::query("SELECT * FROM chunked_files WHERE file_id = ?")
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(chunked_file_from_row).transpose()
}

async fn fetch_chunk(
    conn: &mut SqliteConnection,
    file_id: &str,
    chunk_number: u32,
) -> MetadataResult<Option<ChunkInfo>> {
    let row = sqlx::query("SELECT * FROM file_chunks WHERE file_id = ? AND chunk_number = ?")
        .bind(file_id)
        .bind(i64::from(chunk_number))
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(chunk_from_row).transpose()
}

async fn set_file_status_in(
    conn: &mut SqliteConnection,
    file_id: &str,
    next: FileStatus,
) -> MetadataResult<FileStatus> {
    let file = fetch_chunked_file(conn, file_id)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("chunked file {file_id}")))?;

    let blocked = !file.status.can_transition_to(next)
        || (next == FileStatus::Completed
            && file.status != FileStatus::Completed
            && file.completed_chunks < file.total_chunks);
    if blocked {
        return Err(TransitionError::Invalid {
            from: file.status.to_string(),
            to: next.to_string(),
        }
        .into());
    }

    sqlx::query("UPDATE chunked_files SET status = ?, updated_at = ? WHERE file_id = ?")
        .bind(next.as_str())
        .bind(now())
        .bind(file_id)
        .execute(&mut *conn)
        .await?;
    Ok(next)
}

async fn after_claim(
    conn: &mut SqliteConnection,
    row: Option<SqliteRow>,
) -> MetadataResult<Option<ChunkInfo>> {
    let Some(row) = row else {
        return Ok(None);
    };
    let chunk = chunk_from_row(&row)?;

    sqlx::query(
        "UPDATE chunked_files SET status = 'uploading', updated_at = ? WHERE file_id = ? AND status = 'pending'",
    )
    .bind(now())
    .bind(&chunk.file_id)
    .execute(&mut *conn)
    .await?;

    metrics::record_chunk_claimed();
    debug!(
        file_id = %chunk.file_id,
        chunk_number = chunk.chunk_number,
        retry_count = chunk.retry_count,
        "Chunk claimed"
    );
    Ok(Some(chunk))
}

/// Explain why a conditional update touched no row.
async fn rejected(
    conn: &mut SqliteConnection,
    file_id: &str,
    chunk_number: u32,
    event: ChunkEvent,
) -> MetadataError {
    match fetch_chunk(conn, file_id, chunk_number).await {
        Ok(Some(chunk)) => match chunk
            .status
            .apply(event, chunk.retry_count, &RetryPolicy::new(u32::MAX))
        {
            Err(e) => e.into(),
            Ok(next) => TransitionError::Invalid {
                from: chunk.status.to_string(),
                to: next.to_string(),
            }
            .into(),
        },
        Ok(None) => MetadataError::NotFound(format!("chunk {file_id}#{chunk_number}")),
        Err(e) => e,
    }
}

/// Recount completed chunks and derive the file status from the counts.
/// Exhausted chunks are only counted when a retry ceiling is known; completing
/// a chunk can never exhaust one.
async fn refresh_progress(
    conn: &mut SqliteConnection,
    file_id: &str,
    policy: Option<&RetryPolicy>,
) -> MetadataResult<ChunkProgress> {
    let file = fetch_chunked_file(conn, file_id)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("chunked file {file_id}")))?;

    let completed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM file_chunks WHERE file_id = ? AND status = 'completed'",
    )
    .bind(file_id)
    .fetch_one(&mut *conn)
    .await?;
    let completed = completed as u32;

    let exhausted: i64 = match policy {
        Some(policy) => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM file_chunks WHERE file_id = ? AND status = 'error' AND retry_count >= ?",
            )
            .bind(file_id)
            .bind(i64::from(policy.max_retries))
            .fetch_one(&mut *conn)
            .await?
        }
        None => 0,
    };

    let status = aggregate_file_status(
        file.status,
        file.total_chunks,
        completed,
        exhausted as u32,
    );

    sqlx::query(
        "UPDATE chunked_files SET completed_chunks = ?, status = ?, updated_at = ? WHERE file_id = ?",
    )
    .bind(i64::from(completed))
    .bind(status.as_str())
    .bind(now())
    .bind(file_id)
    .execute(&mut *conn)
    .await?;

    if status != file.status {
        info!(file_id, from = %file.status, to = %status, "Chunked file status changed");
    }

    Ok(ChunkProgress {
        completed_chunks: completed,
        total_chunks: file.total_chunks,
        status,
    })
}

fn chunked_file_from_row(row: &SqliteRow) -> MetadataResult<ChunkedFileInfo> {
    Ok(ChunkedFileInfo {
        file_id: row.try_get("file_id")?,
        original_filename: row.try_get("original_filename")?,
        mime_type: row.try_get("mime_type")?,
        total_size: size_from_sql("total_size", row.try_get("total_size")?)?,
        total_chunks: row.try_get::<i64, _>("total_chunks")? as u32,
        completed_chunks: row.try_get::<i64, _>("completed_chunks")? as u32,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        original_file_hash: row.try_get("original_file_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> MetadataResult<ChunkInfo> {
    Ok(ChunkInfo {
        file_id: row.try_get("file_id")?,
        chunk_number: row.try_get::<i64, _>("chunk_number")? as u32,
        total_chunks: row.try_get::<i64, _>("total_chunks")? as u32,
        chunk_size: size_from_sql("chunk_size", row.try_get("chunk_size")?)?,
        chunk_hash: row.try_get("chunk_hash")?,
        telegram_file_id: row.try_get("telegram_file_id")?,
        message_id: row.try_get("message_id")?,
        uploader_bot_token: row.try_get("uploader_bot_token")?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        error_message: row.try_get("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::database::tests::open_test_db;
    use crate::metadata::types::{FileInfo, MessageRef};

    fn chunked(file_id: &str, total: u32) -> (ChunkedFileInfo, Vec<ChunkInfo>) {
        let mut file = ChunkedFileInfo::new(file_id, format!("{file_id}.iso"), total as u64 * 100, total);
        file.original_file_hash = Some("f".repeat(64));
        let chunks = (0..total)
            .map(|n| ChunkInfo::new(file_id, n, total, 100).with_hash(format!("hash-{n}")))
            .collect();
        (file, chunks)
    }

    async fn register(
        db: &MetadataDatabase,
        file: &ChunkedFileInfo,
        chunks: &[ChunkInfo],
    ) -> ChunkProgress {
        db.register_chunked_file(file, chunks, &RetryPolicy::default())
            .await
            .unwrap()
    }

    fn locator(n: u32) -> BlobLocator {
        BlobLocator {
            message_id: 1000 + i64::from(n),
            telegram_file_id: format!("tg-{n}"),
            uploader_bot_token: if n % 2 == 0 { "bot-a".into() } else { "bot-b".into() },
        }
    }

    #[tokio::test]
    async fn test_register_and_read_back() {
        let (_dir, db) = open_test_db().await;
        let (file, chunks) = chunked("movie", 3);
        let progress = register(&db, &file, &chunks).await;
        assert_eq!(progress.completed_chunks, 0);
        assert_eq!(progress.status, FileStatus::Pending);

        let stored = db.get_chunked_file("movie").await.unwrap().unwrap();
        assert_eq!(stored.total_chunks, 3);
        assert_eq!(stored.original_file_hash, file.original_file_hash);

        let stored_chunks = db.get_chunks("movie").await.unwrap();
        assert_eq!(stored_chunks, chunks);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_number_rolls_back_registration() {
        let (_dir, db) = open_test_db().await;
        let (file, mut chunks) = chunked("dup", 3);
        chunks[2].chunk_number = 1;

        let err = db
            .register_chunked_file(&file, &chunks, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::TransactionAborted { .. }));
        assert!(err.is_integrity_violation());
        assert!(db.get_chunked_file("dup").await.unwrap().is_none());
        assert!(db.get_chunks("dup").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_chunk_duplicate() {
        let (_dir, db) = open_test_db().await;
        let (file, chunks) = chunked("single", 2);
        register(&db, &file, &chunks[..1]).await;

        db.insert_chunk(&chunks[1], &RetryPolicy::default()).await.unwrap();
        let err = db.insert_chunk(&chunks[1], &RetryPolicy::default()).await.unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_chunk_without_parent_is_rejected() {
        let (_dir, db) = open_test_db().await;
        let err = db
            .insert_chunk(&ChunkInfo::new("orphan", 0, 1, 10), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_claim_complete_flow() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::new(3);
        let (file, chunks) = chunked("flow", 2);
        register(&db, &file, &chunks).await;

        let first = db.claim_next_chunk("flow", &policy).await.unwrap().unwrap();
        assert_eq!(first.chunk_number, 0);
        assert_eq!(first.status, ChunkStatus::Uploading);
        assert_eq!(
            db.get_chunked_file("flow").await.unwrap().unwrap().status,
            FileStatus::Uploading
        );

        let second = db.claim_next_chunk("flow", &policy).await.unwrap().unwrap();
        assert_eq!(second.chunk_number, 1);
        assert!(db.claim_next_chunk("flow", &policy).await.unwrap().is_none());

        let progress = db.complete_chunk("flow", 0, &locator(0)).await.unwrap();
        assert_eq!(progress.completed_chunks, 1);
        assert!(!progress.is_complete());

        let progress = db.complete_chunk("flow", 1, &locator(1)).await.unwrap();
        assert!(progress.is_complete());

        let stored = db.get_chunked_file("flow").await.unwrap().unwrap();
        assert_eq!(stored.completed_chunks, 2);
        assert_eq!(stored.status, FileStatus::Completed);

        let chunk = db.get_chunk("flow", 1).await.unwrap().unwrap();
        assert_eq!(chunk.message_id, Some(1001));
        assert_eq!(chunk.uploader_bot_token.as_deref(), Some("bot-b"));
    }

    #[tokio::test]
    async fn test_chunk_completes_only_once() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::new(3);
        let (file, chunks) = chunked("once", 2);
        register(&db, &file, &chunks).await;

        db.claim_chunk("once", 0, &policy).await.unwrap().unwrap();
        db.complete_chunk("once", 0, &locator(0)).await.unwrap();

        let err = db.complete_chunk("once", 0, &locator(0)).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidTransition(_)));
        assert!(db.claim_chunk("once", 0, &policy).await.unwrap().is_none());
        assert_eq!(db.completed_chunk_count("once").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_unclaimed_or_missing_chunk() {
        let (_dir, db) = open_test_db().await;
        let (file, chunks) = chunked("unclaimed", 1);
        register(&db, &file, &chunks).await;

        assert!(matches!(
            db.complete_chunk("unclaimed", 0, &locator(0)).await,
            Err(MetadataError::InvalidTransition(_))
        ));
        assert!(matches!(
            db.complete_chunk("unclaimed", 9, &locator(9)).await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::new(2);
        let (file, chunks) = chunked("flaky", 2);
        register(&db, &file, &chunks).await;

        db.claim_chunk("flaky", 0, &policy).await.unwrap().unwrap();
        let failure = db.fail_chunk("flaky", 0, "timeout", &policy).await.unwrap();
        assert_eq!(failure.retry_count, 1);
        assert!(!failure.exhausted);
        assert_eq!(failure.status, FileStatus::Uploading);

        let retried = db.claim_chunk("flaky", 0, &policy).await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 1);
        let failure = db.fail_chunk("flaky", 0, "timeout", &policy).await.unwrap();
        assert_eq!(failure.retry_count, 2);
        assert!(failure.exhausted);
        assert_eq!(failure.status, FileStatus::Error);

        assert!(db.claim_chunk("flaky", 0, &policy).await.unwrap().is_none());
        let chunk = db.get_chunk("flaky", 0).await.unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Error);
        assert_eq!(chunk.error_message.as_deref(), Some("timeout"));

        // The file failed, so no other chunk is handed out either.
        assert!(db.claim_next_chunk("flaky", &policy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_requires_claim() {
        let (_dir, db) = open_test_db().await;
        let (file, chunks) = chunked("idle", 1);
        register(&db, &file, &chunks).await;

        assert!(matches!(
            db.fail_chunk("idle", 0, "boom", &RetryPolicy::default()).await,
            Err(MetadataError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_claims() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::default();
        let (file, chunks) = chunked("cancel", 3);
        register(&db, &file, &chunks).await;

        db.claim_chunk("cancel", 0, &policy).await.unwrap().unwrap();
        assert_eq!(
            db.cancel_chunked_file("cancel").await.unwrap(),
            FileStatus::Canceled
        );
        assert!(db.claim_next_chunk("cancel", &policy).await.unwrap().is_none());

        // The in-flight upload may still report back; the file stays canceled.
        let progress = db.complete_chunk("cancel", 0, &locator(0)).await.unwrap();
        assert_eq!(progress.status, FileStatus::Canceled);

        assert!(matches!(
            db.update_chunked_file_status("cancel", FileStatus::Uploading).await,
            Err(MetadataError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_status_requires_all_chunks() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::default();
        let (file, chunks) = chunked("partial", 2);
        register(&db, &file, &chunks).await;
        db.claim_chunk("partial", 0, &policy).await.unwrap();

        assert!(matches!(
            db.update_chunked_file_status("partial", FileStatus::Completed).await,
            Err(MetadataError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_info_and_recovery() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::new(3);
        let (file, chunks) = chunked("resume", 4);
        register(&db, &file, &chunks).await;

        db.claim_chunk("resume", 0, &policy).await.unwrap();
        db.complete_chunk("resume", 0, &locator(0)).await.unwrap();
        db.claim_chunk("resume", 1, &policy).await.unwrap();
        db.claim_chunk("resume", 2, &policy).await.unwrap();
        db.fail_chunk("resume", 2, "network", &policy).await.unwrap();

        let info = db.get_resume_info("resume", &policy).await.unwrap();
        assert_eq!(info.completed_chunks, 1);
        assert_eq!(info.in_flight_chunks, 1);
        assert_eq!(info.retryable_chunks, 2);
        assert_eq!(info.exhausted_chunks, 0);
        assert_eq!(info.remaining_chunks(), 3);
        assert!(info.can_resume);

        // Simulated crash: chunk 1 was in flight.
        assert_eq!(db.recover_interrupted().await.unwrap(), 1);
        let chunk = db.get_chunk("resume", 1).await.unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        let info = db.get_resume_info("resume", &policy).await.unwrap();
        assert_eq!(info.in_flight_chunks, 0);
        assert_eq!(info.retryable_chunks, 3);
    }

    #[tokio::test]
    async fn test_cascade_delete_chunked_file() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::default();
        let (file, chunks) = chunked("big", 4);
        register(&db, &file, &chunks).await;
        for n in 0..2 {
            db.claim_chunk("big", n, &policy).await.unwrap();
            db.complete_chunk("big", n, &locator(n)).await.unwrap();
        }
        let mut direct = FileInfo::new("big", "big.iso", 400);
        direct.message_id = Some(1000);
        direct.uploader_bot_token = Some("bot-a".into());
        db.insert_file(&direct).await.unwrap();
        db.insert_file(&FileInfo::new("other", "other.txt", 3)).await.unwrap();

        let preview = db.get_messages_to_delete("big").await.unwrap();
        let refs = db.delete_file("big").await.unwrap();
        assert_eq!(refs, preview);
        assert_eq!(
            refs,
            vec![
                MessageRef { message_id: 1000, uploader_bot_token: Some("bot-a".into()) },
                MessageRef { message_id: 1001, uploader_bot_token: Some("bot-b".into()) },
            ]
        );

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_chunks WHERE file_id = ?")
            .bind("big")
            .fetch_one(&db.pool().unwrap())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(db.get_chunked_file("big").await.unwrap().is_none());
        assert!(db.file_exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_key_cascade_is_enforced_by_store() {
        let (_dir, db) = open_test_db().await;
        let (file, chunks) = chunked("fk", 3);
        register(&db, &file, &chunks).await;

        sqlx::query("DELETE FROM chunked_files WHERE file_id = ?")
            .bind("fk")
            .execute(&db.pool().unwrap())
            .await
            .unwrap();
        assert!(db.get_chunks("fk").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_descriptive_columns() {
        let (_dir, db) = open_test_db().await;
        let (mut file, mut chunks) = chunked("edit", 2);
        register(&db, &file, &chunks).await;

        file.original_filename = "renamed.iso".into();
        file.status = FileStatus::Completed;
        assert!(db.update_chunked_file(&file).await.unwrap());
        let stored = db.get_chunked_file("edit").await.unwrap().unwrap();
        assert_eq!(stored.original_filename, "renamed.iso");
        assert_eq!(stored.status, FileStatus::Pending);

        chunks[1].chunk_hash = Some("rehashed".into());
        assert!(db.update_chunk(&chunks[1]).await.unwrap());
        assert_eq!(
            db.get_chunk("edit", 1).await.unwrap().unwrap().chunk_hash.as_deref(),
            Some("rehashed")
        );

        chunks[1].chunk_number = 9;
        assert!(!db.update_chunk(&chunks[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_registered_exhausted_chunk_fails_file() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::new(3);
        let (file, mut chunks) = chunked("stale", 3);
        chunks[1].status = ChunkStatus::Error;
        chunks[1].retry_count = 3;
        chunks[1].error_message = Some("HTTP 413".into());

        let progress = db.register_chunked_file(&file, &chunks, &policy).await.unwrap();
        assert_eq!(progress.status, FileStatus::Error);
        assert!(db.claim_next_chunk("stale", &policy).await.unwrap().is_none());

        let info = db.get_resume_info("stale", &policy).await.unwrap();
        assert_eq!(info.exhausted_chunks, 1);
        assert!(!info.can_resume);
    }

    #[tokio::test]
    async fn test_inserted_exhausted_chunk_fails_running_file() {
        let (_dir, db) = open_test_db().await;
        let policy = RetryPolicy::new(2);
        let (file, mut chunks) = chunked("late", 2);
        register(&db, &file, &chunks[..1]).await;
        db.claim_chunk("late", 0, &policy).await.unwrap().unwrap();

        chunks[1].status = ChunkStatus::Error;
        chunks[1].retry_count = 2;
        let progress = db.insert_chunk(&chunks[1], &policy).await.unwrap();
        assert_eq!(progress.status, FileStatus::Error);
    }

    #[tokio::test]
    async fn test_registered_complete_file_passes_through_uploading() {
        let (_dir, db) = open_test_db().await;
        let (file, mut chunks) = chunked("imported", 2);
        for (n, chunk) in chunks.iter_mut().enumerate() {
            chunk.status = ChunkStatus::Completed;
            chunk.message_id = Some(n as i64);
        }

        let progress = register(&db, &file, &chunks).await;
        assert!(progress.is_complete());
        assert_eq!(progress.status, FileStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_chunked_files_by_status() {
        let (_dir, db) = open_test_db().await;
        for id in ["a", "b"] {
            let (file, chunks) = chunked(id, 1);
            register(&db, &file, &chunks).await;
        }
        db.cancel_chunked_file("b").await.unwrap();

        assert_eq!(db.list_chunked_files(None).await.unwrap().len(), 2);
        let pending = db.list_chunked_files(Some(FileStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].file_id, "a");
    }
}
