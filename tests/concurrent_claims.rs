use chunkvault::metadata::{BlobLocator, ChunkInfo, ChunkedFileInfo, MetadataDatabase};
use chunkvault::secret::SecretStore;
use chunkvault::transfer::{FileStatus, RetryPolicy};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

const TOTAL_CHUNKS: u32 = 40;
const WORKERS: usize = 8;

async fn open_db(dir: &TempDir) -> Arc<MetadataDatabase> {
    let secrets = Arc::new(SecretStore::new(dir.path().join(".env")));
    let db = MetadataDatabase::new(secrets).allow_unencrypted();
    db.initialize(dir.path().join("metadata.db")).await.unwrap();
    Arc::new(db)
}

async fn register(db: &MetadataDatabase, file_id: &str) {
    let file = ChunkedFileInfo::new(file_id, format!("{file_id}.bin"), TOTAL_CHUNKS as u64 * 10, TOTAL_CHUNKS);
    let chunks: Vec<ChunkInfo> = (0..TOTAL_CHUNKS)
        .map(|n| ChunkInfo::new(file_id, n, TOTAL_CHUNKS, 10))
        .collect();
    db.register_chunked_file(&file, &chunks, &RetryPolicy::default())
        .await
        .unwrap();
}

/// Workers race for chunks; every chunk must be handed out exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_never_double_claim() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    register(&db, "shared").await;
    let policy = RetryPolicy::new(3);

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(chunk) = db.claim_next_chunk("shared", &policy).await.unwrap() {
                let locator = BlobLocator {
                    message_id: i64::from(chunk.chunk_number),
                    telegram_file_id: format!("tg-{}", chunk.chunk_number),
                    uploader_bot_token: format!("bot-{worker}"),
                };
                tokio::task::yield_now().await;
                db.complete_chunk("shared", chunk.chunk_number, &locator)
                    .await
                    .unwrap();
                mine.push(chunk.chunk_number);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for chunk_number in handle.await.unwrap() {
            assert!(seen.insert(chunk_number), "chunk {chunk_number} claimed twice");
            total += 1;
        }
    }

    assert_eq!(total, TOTAL_CHUNKS as usize);
    let file = db.get_chunked_file("shared").await.unwrap().unwrap();
    assert_eq!(file.completed_chunks, TOTAL_CHUNKS);
    assert_eq!(file.status, FileStatus::Completed);
}

/// Many tasks targeting the same chunk: exactly one wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_chunk_single_winner() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    register(&db, "contested").await;
    let policy = RetryPolicy::new(3);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.claim_chunk("contested", 7, &policy).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

/// Failures and retries interleaved across workers keep the counters exact.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_respect_retry_ceiling() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    register(&db, "flaky").await;
    let policy = RetryPolicy::new(2);

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move {
                let mut attempts = 0u32;
                while let Some(chunk) = db.claim_next_chunk("flaky", &policy).await.unwrap() {
                    attempts += 1;
                    // Even chunks fail once, then succeed.
                    if chunk.chunk_number % 2 == 0 && chunk.retry_count == 0 {
                        db.fail_chunk("flaky", chunk.chunk_number, "transient", &policy)
                            .await
                            .unwrap();
                        continue;
                    }
                    let locator = BlobLocator {
                        message_id: i64::from(chunk.chunk_number),
                        telegram_file_id: format!("tg-{}", chunk.chunk_number),
                        uploader_bot_token: "bot".into(),
                    };
                    db.complete_chunk("flaky", chunk.chunk_number, &locator)
                        .await
                        .unwrap();
                }
                attempts
            })
        })
        .collect();

    let mut attempts = 0;
    for handle in handles {
        attempts += handle.await.unwrap();
    }

    assert_eq!(attempts, TOTAL_CHUNKS + TOTAL_CHUNKS / 2);
    let file = db.get_chunked_file("flaky").await.unwrap().unwrap();
    assert_eq!(file.status, FileStatus::Completed);
    let retried = db
        .get_chunks("flaky")
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.retry_count == 1)
        .count();
    assert_eq!(retried, (TOTAL_CHUNKS / 2) as usize);
}
