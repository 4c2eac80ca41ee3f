pub mod cipher;
pub mod entries;
pub mod error;
pub mod store;

pub use cipher::EncryptedBlob;
pub use entries::Entries;
pub use error::{SecretError, SecretResult};
pub use store::{SecretStore, DEFAULT_STORE_FILE, PLAINTEXT_FALLBACKS};
