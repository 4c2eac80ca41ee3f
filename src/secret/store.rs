use crate::metrics;
use crate::secret::cipher::EncryptedBlob;
use crate::secret::entries::{self, Entries};
use crate::secret::error::{SecretError, SecretResult};
use parking_lot::RwLock;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Default file name of the encrypted store.
pub const DEFAULT_STORE_FILE: &str = ".env";

/// Plaintext files tried, in order, next to the encrypted store when it is absent.
pub const PLAINTEXT_FALLBACKS: [&str; 2] = [".env.plain", ".env.local"];

/// Encrypted flat key-value store backed by a single file.
///
/// Reads and writes operate on the in-memory map; nothing is durable until
/// [`SecretStore::save`] rewrites the whole file. A store that has not read
/// its file never overwrites a non-empty one.
pub struct SecretStore {
    path: PathBuf,
    fallbacks: Vec<PathBuf>,
    entries: RwLock<Entries>,
    loaded: AtomicBool,
}

impl SecretStore {
    /// Create an empty store bound to `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let fallbacks = PLAINTEXT_FALLBACKS.iter().map(|name| dir.join(name)).collect();

        Self {
            path,
            fallbacks,
            entries: RwLock::new(Entries::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Replace the plaintext migration candidates.
    pub fn with_plaintext_fallbacks(mut self, fallbacks: Vec<PathBuf>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Create a store bound to `path` and load it.
    pub fn open(path: impl AsRef<Path>) -> SecretResult<Self> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether memory reflects the file: it was loaded, or written by this store.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Load the file unless that already happened. Entries set before the
    /// load take precedence over the file; a missing configuration is not an
    /// error here.
    pub fn ensure_loaded(&self) -> SecretResult<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let pending = std::mem::take(&mut *self.entries.write());
        let result = self.load();
        self.entries.write().extend(pending);

        match result {
            Err(e) if e.is_missing() => Ok(()),
            other => other,
        }
    }

    /// Read and decrypt the store file into memory.
    ///
    /// An absent or empty file triggers migration from the first plaintext
    /// fallback that exists; the migrated entries are saved encrypted at once.
    pub fn load(&self) -> SecretResult<()> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if text.trim().is_empty() {
            return self.migrate_from_fallbacks();
        }

        let blob = EncryptedBlob::parse(&text)?;
        let plaintext = blob.open()?;
        let body = std::str::from_utf8(&plaintext)
            .map_err(|_| SecretError::DecryptionFailed("decrypted body is not UTF-8".into()))?;
        let loaded = entries::parse_body(body)?;

        debug!(path = %self.path.display(), keys = loaded.len(), "Loaded secret store");
        *self.entries.write() = loaded;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn migrate_from_fallbacks(&self) -> SecretResult<()> {
        for candidate in &self.fallbacks {
            if candidate.is_file() {
                info!(
                    from = %candidate.display(),
                    to = %self.path.display(),
                    "Migrating plaintext configuration into encrypted store"
                );
                return self.initialize_from_plaintext(candidate);
            }
        }
        Err(SecretError::ConfigMissing(self.path.clone()))
    }

    /// Serialize, encrypt and atomically replace the store file.
    ///
    /// Each save derives a new key from the new content. Fails with
    /// [`SecretError::NotLoaded`] if the file has content this store never read.
    pub fn save(&self) -> SecretResult<()> {
        if !self.is_loaded() && has_content(&self.path)? {
            return Err(SecretError::NotLoaded(self.path.clone()));
        }

        let body = {
            let guard = self.entries.read();
            for (key, value) in guard.iter() {
                entries::validate(key, value)?;
            }
            Zeroizing::new(entries::serialize(&guard))
        };

        let blob = EncryptedBlob::seal(body.as_bytes())?;
        write_replacing(&self.path, blob.encode().as_bytes())?;
        self.loaded.store(true, Ordering::Release);

        metrics::record_secret_store_saved();
        debug!(path = %self.path.display(), "Saved secret store");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// Returns the previous value, if any.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.write().remove(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Copy of every entry.
    pub fn get_all(&self) -> Entries {
        self.entries.read().clone()
    }

    /// Parse a plaintext `KEY=VALUE` file into memory and save it encrypted.
    /// Entries already in memory are kept unless the file overrides them.
    pub fn initialize_from_plaintext(&self, path: impl AsRef<Path>) -> SecretResult<()> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let parsed = entries::parse_plaintext(&text);
        let count = parsed.len();

        self.entries.write().extend(parsed);
        self.save()?;

        info!(keys = count, "Imported plaintext configuration");
        Ok(())
    }

    /// Write the current entries out unencrypted. Never called implicitly.
    pub fn export_to_plaintext(&self, path: impl AsRef<Path>) -> SecretResult<()> {
        let mut body = entries::serialize(&self.entries.read());
        body.push('\n');
        write_replacing(path.as_ref(), body.as_bytes())?;

        info!(path = %path.as_ref().display(), "Exported configuration as plaintext");
        Ok(())
    }
}

fn has_content(path: &Path) -> SecretResult<bool> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(!text.trim().is_empty()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file and rename it over `path`, so readers see
/// either the old file or the new one.
fn write_replacing(path: &Path, contents: &[u8]) -> SecretResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| SecretError::Io(e.error))?;
    Ok(())
}
