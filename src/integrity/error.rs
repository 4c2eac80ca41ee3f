use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Chunk {0} has no recorded hash")]
    MissingHash(u32),

    #[error("Chunk {0} has not been staged")]
    NotStaged(u32),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type IntegrityResult<T> = Result<T, IntegrityError>;
