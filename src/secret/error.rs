use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("No configuration found at {0}")]
    ConfigMissing(PathBuf),

    #[error("Configuration blob is malformed: {0}")]
    ConfigCorrupt(String),

    #[error("Configuration could not be decrypted: {0}")]
    DecryptionFailed(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Refusing to overwrite {0}: it was never loaded into this store")]
    NotLoaded(PathBuf),

    #[error("Invalid entry for key '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecretError {
    /// Message for operators. A missing configuration and an unreadable one
    /// need different remedies, so they never share wording.
    pub fn user_message(&self) -> String {
        match self {
            SecretError::ConfigMissing(path) => format!(
                "No configuration found at {}. Create one with `vaultctl import <plaintext-file>`.",
                path.display()
            ),
            SecretError::ConfigCorrupt(_) | SecretError::DecryptionFailed(_) => format!(
                "Configuration is present but unreadable ({self}). The file was modified or \
                 its key material is lost; restore it from a backup or re-import the plaintext."
            ),
            other => other.to_string(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, SecretError::ConfigMissing(_))
    }
}

pub type SecretResult<T> = Result<T, SecretError>;
