//! Content hashes for chunks and whole files (lowercase hex BLAKE3).

pub mod error;
pub mod types;
pub mod verifier;

pub use error::{IntegrityError, IntegrityResult};
pub use types::{BatchVerificationSummary, FailedChunk};
pub use verifier::IntegrityVerifier;
