use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Register metric descriptions. Safe to call more than once.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "chunkvault_secret_store_saves_total",
        "Encrypted configuration writes"
    );
    describe_counter!("chunkvault_files_deleted_total", "Files removed from the store");
    describe_counter!(
        "chunkvault_backend_messages_released_total",
        "Backend messages handed back for deletion"
    );
    describe_counter!("chunkvault_chunks_claimed_total", "Chunks claimed by workers");
    describe_counter!(
        "chunkvault_chunks_completed_total",
        "Chunks acknowledged by the backend"
    );
    describe_counter!(
        "chunkvault_chunks_failed_total",
        "Failed chunk attempts, labelled by whether retries ran out"
    );
    describe_gauge!(
        "chunkvault_storage_used_bytes",
        "Bytes recorded in the files table"
    );
}

// ============== Secret store ==============

pub fn record_secret_store_saved() {
    counter!("chunkvault_secret_store_saves_total").increment(1);
}

// ============== Files ==============

/// Record a deleted file and the backend messages it left behind.
pub fn record_file_deleted(messages: usize) {
    counter!("chunkvault_files_deleted_total").increment(1);
    counter!("chunkvault_backend_messages_released_total").increment(messages as u64);
}

pub fn set_storage_used(bytes: u64) {
    gauge!("chunkvault_storage_used_bytes").set(bytes as f64);
}

// ============== Chunks ==============

pub fn record_chunk_claimed() {
    counter!("chunkvault_chunks_claimed_total").increment(1);
}

pub fn record_chunk_completed() {
    counter!("chunkvault_chunks_completed_total").increment(1);
}

pub fn record_chunk_failed(exhausted: bool) {
    let outcome = if exhausted { "exhausted" } else { "retryable" };
    counter!("chunkvault_chunks_failed_total", "outcome" => outcome).increment(1);
}
