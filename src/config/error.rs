use crate::secret::SecretError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required setting is missing or a value does not parse.
    #[error("{message}")]
    Validation { field: &'static str, message: String },

    /// A layer could not be read or merged.
    #[error("Configuration could not be loaded: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Secret store error: {0}")]
    Secret(#[from] SecretError),
}

impl ConfigError {
    pub(crate) fn required(field: &'static str) -> Self {
        ConfigError::Validation {
            field,
            message: format!("{field} is required"),
        }
    }

    pub(crate) fn invalid(field: &'static str) -> Self {
        ConfigError::Validation {
            field,
            message: format!("Invalid {field}"),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
