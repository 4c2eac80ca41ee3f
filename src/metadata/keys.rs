//! At-rest key for the metadata store, kept in the secret store.

use crate::metadata::error::{MetadataError, MetadataResult};
use crate::secret::SecretStore;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;
use zeroize::Zeroizing;

/// Secret store entry holding the database key.
pub const DB_KEY_NAME: &str = "DB_ENCRYPTION_KEY";

const KEY_BYTES: usize = 32;

/// 256-bit key as lowercase hex.
pub struct DatabaseKey(Zeroizing<String>);

impl DatabaseKey {
    fn parse(hex_key: &str) -> MetadataResult<Self> {
        let valid = hex_key.len() == KEY_BYTES * 2
            && hex_key.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(MetadataError::InvalidKey(format!(
                "{DB_KEY_NAME} must be {} hex characters",
                KEY_BYTES * 2
            )));
        }
        Ok(Self(Zeroizing::new(hex_key.to_ascii_lowercase())))
    }

    fn generate() -> MetadataResult<Self> {
        let mut bytes = Zeroizing::new([0u8; KEY_BYTES]);
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| MetadataError::InvalidKey(format!("key generation failed: {e}")))?;
        Ok(Self(Zeroizing::new(hex::encode(&bytes[..]))))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Value for `PRAGMA key`: a raw key literal, so no passphrase KDF runs.
    pub(crate) fn pragma_value(&self) -> String {
        format!("\"x'{}'\"", self.as_hex())
    }
}

impl std::fmt::Debug for DatabaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DatabaseKey(..)")
    }
}

/// Return the stored key, generating and persisting one on first use.
///
/// The store's file is loaded first if the caller has not done so. A new key
/// is saved to disk before it is handed out; data encrypted with a key that
/// was never persisted cannot be recovered.
pub fn ensure_database_key(secrets: &SecretStore) -> MetadataResult<DatabaseKey> {
    secrets.ensure_loaded()?;
    if let Some(existing) = secrets.get(DB_KEY_NAME) {
        return DatabaseKey::parse(existing.trim());
    }

    let key = DatabaseKey::generate()?;
    secrets.set(DB_KEY_NAME, key.as_hex());
    if let Err(e) = secrets.save() {
        secrets.remove(DB_KEY_NAME);
        return Err(e.into());
    }

    info!("Generated new metadata store encryption key");
    Ok(key)
}
