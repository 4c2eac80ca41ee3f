use serde::{Deserialize, Serialize};

/// A staged chunk that failed verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedChunk {
    pub chunk_number: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVerificationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub failed_chunks: Vec<FailedChunk>,
}

impl BatchVerificationSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.passed as f64 / self.total as f64) * 100.0
    }
}
