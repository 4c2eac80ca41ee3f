//! Encrypted configuration and transactional metadata for a chunked blob
//! store backed by a bot messaging API.

pub mod config;
pub mod integrity;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod secret;
pub mod transfer;
