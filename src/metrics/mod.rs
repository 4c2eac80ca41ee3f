//! Counters for state-machine events.
//!
//! Recorded through the `metrics` facade; without an installed recorder the
//! calls are no-ops. No exporter ships with the crate.

pub mod recorder;

pub use recorder::{
    init_metrics, record_chunk_claimed, record_chunk_completed, record_chunk_failed,
    record_file_deleted, record_secret_store_saved, set_storage_used,
};
