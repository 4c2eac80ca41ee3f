//! Self-keyed blob codec.
//!
//! On-disk form: `base64(iv) | hex(sha256(plaintext)) | base64(aes256cbc(plaintext))`.
//! The AES key is PBKDF2-HMAC-SHA256 over the hex hash string, so the blob
//! carries everything needed to open it. This hides the configuration from
//! casual inspection only; it is not confidentiality against anyone who can
//! read the file.

use crate::secret::error::{SecretError, SecretResult};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Fixed 19-byte KDF salt. Changing it orphans every existing blob.
pub const KDF_SALT: &[u8; 19] = b"TeleStoreConfigSalt";
pub const KDF_ITERATIONS: u32 = 100_000;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const FIELD_SEPARATOR: char = '|';

const HASH_HEX_LEN: usize = 64;
const BLOCK_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Hex SHA-256 of the serialized plaintext.
pub fn content_hash(plaintext: &[u8]) -> String {
    hex::encode(Sha256::digest(plaintext))
}

/// Derive the AES-256 key from a recorded content hash.
pub fn derive_key(content_hash: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(
        content_hash.as_bytes(),
        KDF_SALT,
        KDF_ITERATIONS,
        &mut key[..],
    );
    key
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub iv: [u8; IV_LEN],
    pub content_hash: String,
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Encrypt `plaintext` under a key derived from its own hash and a fresh IV.
    pub fn seal(plaintext: &[u8]) -> SecretResult<Self> {
        let mut iv = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| SecretError::Crypto(format!("IV generation failed: {e}")))?;

        let content_hash = content_hash(plaintext);
        let key = derive_key(&content_hash);
        let ciphertext = Aes256CbcEnc::new((&*key).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        Ok(Self {
            iv,
            content_hash,
            ciphertext,
        })
    }

    /// Decrypt and check the result against the recorded hash.
    ///
    /// CBC is unauthenticated, so a tampered blob can still unpad cleanly;
    /// the hash comparison is what turns that into `DecryptionFailed`.
    pub fn open(&self) -> SecretResult<Zeroizing<Vec<u8>>> {
        let key = derive_key(&self.content_hash);
        let plaintext = Aes256CbcDec::new((&*key).into(), (&self.iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&self.ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| SecretError::DecryptionFailed("invalid padding".into()))?;

        if content_hash(&plaintext) != self.content_hash {
            return Err(SecretError::DecryptionFailed(
                "content hash does not match decrypted body".into(),
            ));
        }

        Ok(plaintext)
    }

    /// Parse the pipe-delimited text form. Surrounding whitespace is ignored.
    pub fn parse(text: &str) -> SecretResult<Self> {
        let fields: Vec<&str> = text.trim().split(FIELD_SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(SecretError::ConfigCorrupt(format!(
                "expected 3 fields separated by '{FIELD_SEPARATOR}', found {}",
                fields.len()
            )));
        }

        let iv_bytes = STANDARD
            .decode(fields[0])
            .map_err(|e| SecretError::ConfigCorrupt(format!("IV is not base64: {e}")))?;
        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            SecretError::ConfigCorrupt(format!(
                "IV must be {IV_LEN} bytes, got {}",
                iv_bytes.len()
            ))
        })?;

        let content_hash = fields[1];
        if content_hash.len() != HASH_HEX_LEN || hex::decode(content_hash).is_err() {
            return Err(SecretError::ConfigCorrupt(
                "content hash is not a 64-character hex string".into(),
            ));
        }

        let ciphertext = STANDARD
            .decode(fields[2])
            .map_err(|e| SecretError::ConfigCorrupt(format!("ciphertext is not base64: {e}")))?;
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(SecretError::ConfigCorrupt(format!(
                "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
                ciphertext.len()
            )));
        }

        Ok(Self {
            iv,
            content_hash: content_hash.to_string(),
            ciphertext,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            STANDARD.encode(self.iv),
            self.content_hash,
            STANDARD.encode(&self.ciphertext),
            sep = FIELD_SEPARATOR
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_is_nineteen_bytes() {
        assert_eq!(KDF_SALT.len(), 19);
    }

    #[test]
    fn test_key_depends_only_on_hash() {
        let hash = content_hash(b"BOT_TOKEN=1");
        assert_eq!(*derive_key(&hash), *derive_key(&hash));
        assert_ne!(*derive_key(&hash), *derive_key(&content_hash(b"BOT_TOKEN=2")));
    }

    #[test]
    fn test_seal_and_open() {
        let blob = EncryptedBlob::seal(b"A=1\nB=2").unwrap();
        assert_eq!(blob.content_hash, content_hash(b"A=1\nB=2"));
        assert_eq!(blob.open().unwrap().as_slice(), b"A=1\nB=2");
    }

    #[test]
    fn test_fresh_iv_per_seal() {
        let a = EncryptedBlob::seal(b"same").unwrap();
        let b = EncryptedBlob::seal(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_text_form_has_two_separators() {
        let blob = EncryptedBlob::seal(b"K=V").unwrap();
        let text = blob.encode();
        assert_eq!(text.matches(FIELD_SEPARATOR).count(), 2);
        assert_eq!(EncryptedBlob::parse(&text).unwrap(), blob);
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = EncryptedBlob::parse("abc|def").unwrap_err();
        assert!(matches!(err, SecretError::ConfigCorrupt(_)));

        let err = EncryptedBlob::parse("plain text without separators").unwrap_err();
        assert!(matches!(err, SecretError::ConfigCorrupt(_)));
    }

    #[test]
    fn test_parse_rejects_bad_iv_length() {
        let blob = EncryptedBlob::seal(b"K=V").unwrap();
        let text = format!(
            "{}|{}|{}",
            STANDARD.encode([0u8; 8]),
            blob.content_hash,
            STANDARD.encode(&blob.ciphertext)
        );
        assert!(matches!(
            EncryptedBlob::parse(&text),
            Err(SecretError::ConfigCorrupt(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let mut blob = EncryptedBlob::seal(b"BOT_TOKEN=123:abc\nCHANNEL_ID=-100555").unwrap();
        blob.ciphertext[0] ^= 0x01;
        assert!(matches!(
            blob.open(),
            Err(SecretError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_tampered_hash_is_rejected() {
        let mut blob = EncryptedBlob::seal(b"BOT_TOKEN=123:abc").unwrap();
        let flipped = if blob.content_hash.starts_with('0') { "1" } else { "0" };
        blob.content_hash.replace_range(0..1, flipped);
        assert!(matches!(
            blob.open(),
            Err(SecretError::DecryptionFailed(_))
        ));
    }
}
