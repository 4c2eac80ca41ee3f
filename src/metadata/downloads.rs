//! Downloads being reassembled from chunks staged in a temp directory.

use crate::metadata::chunks::now;
use crate::metadata::database::{
    finish, parse_status, size_from_sql, size_to_sql, MetadataDatabase,
};
use crate::metadata::error::{MetadataError, MetadataResult};
use crate::metadata::types::{ChunkFailure, DownloadChunkInfo, DownloadInfo, DownloadProgress};
use crate::transfer::{
    aggregate_download_status, ChunkStatus, DownloadStatus, RetryPolicy, TransitionError,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

impl MetadataDatabase {
    /// Insert a download and its chunk rows atomically. The download status is
    /// derived from the rows, as for chunked uploads.
    pub async fn create_download(
        &self,
        download: &DownloadInfo,
        chunks: &[DownloadChunkInfo],
        policy: &RetryPolicy,
    ) -> MetadataResult<DownloadProgress> {
        if let Some(stray) = chunks
            .iter()
            .find(|c| c.download_id != download.download_id || c.chunk_number >= download.total_chunks)
        {
            return Err(MetadataError::IntegrityViolation(format!(
                "chunk {} does not fit download {}",
                stray.chunk_number, download.download_id
            )));
        }

        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            sqlx::query(
                r#"
                INSERT INTO downloads
                (download_id, file_id, file_name, target_path, temp_dir, total_size,
                 total_chunks, completed_chunks, status, error_message, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
                "#,
            )
            .bind(&download.download_id)
            .bind(&download.file_id)
            .bind(&download.file_name)
            .bind(&download.target_path)
            .bind(&download.temp_dir)
            .bind(size_to_sql("total_size", download.total_size)?)
            .bind(i64::from(download.total_chunks))
            .bind(download.status.as_str())
            .bind(&download.error_message)
            .bind(download.created_at)
            .bind(download.updated_at)
            .execute(&mut *tx)
            .await?;

            for chunk in chunks {
                sqlx::query(
                    r#"
                    INSERT INTO download_chunks
                    (download_id, chunk_number, chunk_size, chunk_hash, telegram_file_id,
                     bot_token, temp_path, status, retry_count, error_message, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&chunk.download_id)
                .bind(i64::from(chunk.chunk_number))
                .bind(size_to_sql("chunk_size", chunk.chunk_size)?)
                .bind(&chunk.chunk_hash)
                .bind(&chunk.telegram_file_id)
                .bind(&chunk.bot_token)
                .bind(&chunk.temp_path)
                .bind(chunk.status.as_str())
                .bind(i64::from(chunk.retry_count))
                .bind(&chunk.error_message)
                .bind(now())
                .execute(&mut *tx)
                .await?;
            }

            refresh_download(&mut tx, &download.download_id, Some(policy)).await
        }
        .await;
        let progress = finish(tx, "create_download", result).await?;

        info!(
            download_id = %download.download_id,
            file_id = %download.file_id,
            total_chunks = download.total_chunks,
            "Created download"
        );
        Ok(progress)
    }

    pub async fn get_download(&self, download_id: &str) -> MetadataResult<Option<DownloadInfo>> {
        let mut conn = self.pool()?.acquire().await?;
        fetch_download(&mut conn, download_id).await
    }

    /// Newest first, optionally filtered by status.
    pub async fn list_downloads(
        &self,
        status: Option<DownloadStatus>,
    ) -> MetadataResult<Vec<DownloadInfo>> {
        let pool = self.pool()?;
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM downloads WHERE status = ? ORDER BY created_at DESC, download_id",
                )
                .bind(status.as_str())
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM downloads ORDER BY created_at DESC, download_id")
                    .fetch_all(&pool)
                    .await?
            }
        };

        rows.iter().map(download_from_row).collect()
    }

    pub async fn get_download_chunks(
        &self,
        download_id: &str,
    ) -> MetadataResult<Vec<DownloadChunkInfo>> {
        let rows = sqlx::query(
            "SELECT * FROM download_chunks WHERE download_id = ? ORDER BY chunk_number",
        )
        .bind(download_id)
        .fetch_all(&self.pool()?)
        .await?;

        rows.iter().map(download_chunk_from_row).collect()
    }

    /// Claim the lowest-numbered chunk that still needs fetching.
    pub async fn claim_download_chunk(
        &self,
        download_id: &str,
        policy: &RetryPolicy,
    ) -> MetadataResult<Option<DownloadChunkInfo>> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let row = sqlx::query(
                r#"
                UPDATE download_chunks SET status = 'downloading', updated_at = ?
                WHERE id = (
                    SELECT c.id FROM download_chunks c
                    JOIN downloads d ON d.download_id = c.download_id
                    WHERE c.download_id = ?
                      AND d.status IN ('pending', 'downloading')
                      AND (c.status = 'pending' OR (c.status = 'error' AND c.retry_count < ?))
                    ORDER BY c.chunk_number
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(now())
            .bind(download_id)
            .bind(i64::from(policy.max_retries))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let chunk = download_chunk_from_row(&row)?;

            sqlx::query(
                "UPDATE downloads SET status = 'downloading', updated_at = ? WHERE download_id = ? AND status = 'pending'",
            )
            .bind(now())
            .bind(download_id)
            .execute(&mut *tx)
            .await?;

            Ok(Some(chunk))
        }
        .await;
        let claimed = finish(tx, "claim_download_chunk", result).await?;

        if let Some(chunk) = &claimed {
            debug!(download_id, chunk_number = chunk.chunk_number, "Download chunk claimed");
        }
        Ok(claimed)
    }

    /// Record that a chunk was fetched and staged at `temp_path`.
    pub async fn complete_download_chunk(
        &self,
        download_id: &str,
        chunk_number: u32,
        temp_path: &str,
    ) -> MetadataResult<DownloadProgress> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let updated = sqlx::query(
                r#"
                UPDATE download_chunks SET
                    status = 'completed', temp_path = ?, error_message = NULL, updated_at = ?
                WHERE download_id = ? AND chunk_number = ? AND status = 'downloading'
                "#,
            )
            .bind(temp_path)
            .bind(now())
            .bind(download_id)
            .bind(i64::from(chunk_number))
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(
                    rejected(&mut tx, download_id, chunk_number, DownloadStatus::Completed).await,
                );
            }
            refresh_download(&mut tx, download_id, None).await
        }
        .await;
        let progress = finish(tx, "complete_download_chunk", result).await?;

        debug!(
            download_id,
            chunk_number,
            completed = progress.completed_chunks,
            total = progress.total_chunks,
            "Download chunk completed"
        );
        Ok(progress)
    }

    pub async fn fail_download_chunk(
        &self,
        download_id: &str,
        chunk_number: u32,
        error_message: &str,
        policy: &RetryPolicy,
    ) -> MetadataResult<ChunkFailure<DownloadStatus>> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let retry_count: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE download_chunks SET
                    status = 'error', retry_count = retry_count + 1,
                    error_message = ?, updated_at = ?
                WHERE download_id = ? AND chunk_number = ? AND status = 'downloading'
                RETURNING retry_count
                "#,
            )
            .bind(error_message)
            .bind(now())
            .bind(download_id)
            .bind(i64::from(chunk_number))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(retry_count) = retry_count else {
                return Err(
                    rejected(&mut tx, download_id, chunk_number, DownloadStatus::Error).await,
                );
            };
            let retry_count = retry_count as u32;
            let exhausted = ChunkStatus::Error.is_terminal(retry_count, policy);
            if exhausted {
                sqlx::query("UPDATE downloads SET error_message = ? WHERE download_id = ?")
                    .bind(format!("chunk {chunk_number}: {error_message}"))
                    .bind(download_id)
                    .execute(&mut *tx)
                    .await?;
            }
            let progress = refresh_download(&mut tx, download_id, Some(policy)).await?;

            Ok(ChunkFailure {
                retry_count,
                exhausted,
                status: progress.status,
            })
        }
        .await;
        let failure = finish(tx, "fail_download_chunk", result).await?;

        if failure.exhausted {
            warn!(download_id, chunk_number, retry_count = failure.retry_count, "Download chunk retries exhausted");
        }
        Ok(failure)
    }

    pub async fn cancel_download(&self, download_id: &str) -> MetadataResult<DownloadStatus> {
        let mut tx = self.begin().await?;
        let result: MetadataResult<_> = async {
            let download = fetch_download(&mut tx, download_id)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("download {download_id}")))?;
            if !download.status.can_transition_to(DownloadStatus::Canceled) {
                return Err(TransitionError::Invalid {
                    from: download.status.to_string(),
                    to: DownloadStatus::Canceled.to_string(),
                }
                .into());
            }

            sqlx::query("UPDATE downloads SET status = 'canceled', updated_at = ? WHERE download_id = ?")
                .bind(now())
                .bind(download_id)
                .execute(&mut *tx)
                .await?;
            Ok(DownloadStatus::Canceled)
        }
        .await;
        let status = finish(tx, "cancel_download", result).await?;

        info!(download_id, "Canceled download");
        Ok(status)
    }

    /// Remove a download and its chunk rows. Staged files are the caller's.
    pub async fn delete_download(&self, download_id: &str) -> MetadataResult<()> {
        let deleted = sqlx::query("DELETE FROM downloads WHERE download_id = ?")
            .bind(download_id)
            .execute(&self.pool()?)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("download {download_id}")));
        }
        info!(download_id, "Deleted download");
        Ok(())
    }
}

async fn fetch_download(
    conn: &mut SqliteConnection,
    download_id: &str,
) -> MetadataResult<Option<DownloadInfo>> {
    let row = sqlx::query("SELECT * FROM downloads WHERE download_id = ?")
        .bind(download_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(download_from_row).transpose()
}

async fn rejected(
    conn: &mut SqliteConnection,
    download_id: &str,
    chunk_number: u32,
    target: DownloadStatus,
) -> MetadataError {
    let status: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
        "SELECT status FROM download_chunks WHERE download_id = ? AND chunk_number = ?",
    )
    .bind(download_id)
    .bind(i64::from(chunk_number))
    .fetch_optional(&mut *conn)
    .await;

    match status {
        Ok(Some(from)) => TransitionError::Invalid {
            from,
            to: target.to_string(),
        }
        .into(),
        Ok(None) => MetadataError::NotFound(format!("download chunk {download_id}#{chunk_number}")),
        Err(e) => e.into(),
    }
}

async fn refresh_download(
    conn: &mut SqliteConnection,
    download_id: &str,
    policy: Option<&RetryPolicy>,
) -> MetadataResult<DownloadProgress> {
    let download = fetch_download(conn, download_id)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("download {download_id}")))?;

    let completed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM download_chunks WHERE download_id = ? AND status = 'completed'",
    )
    .bind(download_id)
    .fetch_one(&mut *conn)
    .await?;
    let completed = completed as u32;

    let exhausted: i64 = match policy {
        Some(policy) => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM download_chunks WHERE download_id = ? AND status = 'error' AND retry_count >= ?",
            )
            .bind(download_id)
            .bind(i64::from(policy.max_retries))
            .fetch_one(&mut *conn)
            .await?
        }
        None => 0,
    };

    let status = aggregate_download_status(
        download.status,
        download.total_chunks,
        completed,
        exhausted as u32,
    );

    sqlx::query(
        "UPDATE downloads SET completed_chunks = ?, status = ?, updated_at = ? WHERE download_id = ?",
    )
    .bind(i64::from(completed))
    .bind(status.as_str())
    .bind(now())
    .bind(download_id)
    .execute(&mut *conn)
    .await?;

    if status != download.status {
        info!(download_id, from = %download.status, to = %status, "Download status changed");
    }

    Ok(DownloadProgress {
        completed_chunks: completed,
        total_chunks: download.total_chunks,
        status,
    })
}

fn download_from_row(row: &SqliteRow) -> MetadataResult<DownloadInfo> {
    Ok(DownloadInfo {
        download_id: row.try_get("download_id")?,
        file_id: row.try_get("file_id")?,
        file_name: row.try_get("file_name")?,
        target_path: row.try_get("target_path")?,
        temp_dir: row.try_get("temp_dir")?,
        total_size: size_from_sql("total_size", row.try_get("total_size")?)?,
        total_chunks: row.try_get::<i64, _>("total_chunks")? as u32,
        completed_chunks: row.try_get::<i64, _>("completed_chunks")? as u32,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn download_chunk_from_row(row: &SqliteRow) -> MetadataResult<DownloadChunkInfo> {
    Ok(DownloadChunkInfo {
        download_id: row.try_get("download_id")?,
        chunk_number: row.try_get::<i64, _>("chunk_number")? as u32,
        chunk_size: size_from_sql("chunk_size", row.try_get("chunk_size")?)?,
        chunk_hash: row.try_get("chunk_hash")?,
        telegram_file_id: row.try_get("telegram_file_id")?,
        bot_token: row.try_get("bot_token")?,
        temp_path: row.try_get("temp_path")?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        error_message: row.try_get("error_message")?,
    })
}
