//! Credential vault
//!
//! Secrets are persisted as `hex(iv):hex(ciphertext)` envelopes, encrypted
//! with AES-256-CBC under a machine-bound key that is cached in `key.dat`.

use crate::error::{AppError, AppResult};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use once_cell::sync::OnceCell;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const ENVELOPE_SEPARATOR: char = ':';

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Whether a stored value already has the envelope shape.
///
/// Anything else is plaintext awaiting encryption.
pub fn is_envelope(value: &str) -> bool {
    let Some((iv, ciphertext)) = value.split_once(ENVELOPE_SEPARATOR) else {
        return false;
    };

    !ciphertext.contains(ENVELOPE_SEPARATOR)
        && iv.len() == IV_LEN * 2
        && !ciphertext.is_empty()
        && ciphertext.len() % (BLOCK_LEN * 2) == 0
        && is_hex(iv)
        && is_hex(ciphertext)
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Stable machine fingerprint: hostname + OS + architecture
fn machine_fingerprint() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());

    format!("{}{}{}", hostname, std::env::consts::OS, std::env::consts::ARCH)
}

fn derive_machine_key() -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(machine_fingerprint().as_bytes());
    hasher.finalize().into()
}

/// Encrypts and decrypts secret fields of server records
pub struct CredentialVault {
    key_path: PathBuf,
    key: OnceCell<[u8; KEY_LEN]>,
}

impl CredentialVault {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            key: OnceCell::new(),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Load the key file, deriving and writing it on first use
    fn key(&self) -> AppResult<&[u8; KEY_LEN]> {
        self.key.get_or_try_init(|| {
            if self.key_path.exists() {
                let key_data = fs::read(&self.key_path)?;
                if key_data.len() != KEY_LEN {
                    return Err(AppError::Config(format!(
                        "Key file {} has invalid length {}",
                        self.key_path.display(),
                        key_data.len()
                    )));
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&key_data);
                return Ok(key);
            }

            let key = derive_machine_key();

            if let Some(parent) = self.key_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.key_path, key)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o600);
                let _ = fs::set_permissions(&self.key_path, perms);
            }

            tracing::info!("Created encryption key file at {:?}", self.key_path);
            Ok(key)
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let key = self.key()?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|e| AppError::Config(format!("Failed to create cipher: {}", e)))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!(
            "{}{}{}",
            hex::encode(iv),
            ENVELOPE_SEPARATOR,
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, envelope: &str) -> AppResult<String> {
        if !is_envelope(envelope) {
            return Err(AppError::Decryption("Malformed envelope".to_string()));
        }
        let (iv_hex, ciphertext_hex) = envelope
            .split_once(ENVELOPE_SEPARATOR)
            .ok_or_else(|| AppError::Decryption("Missing separator".to_string()))?;

        let iv = hex::decode(iv_hex).map_err(|e| AppError::Decryption(e.to_string()))?;
        let ciphertext = hex::decode(ciphertext_hex).map_err(|e| AppError::Decryption(e.to_string()))?;

        let key = self.key()?;
        let cipher = Aes256CbcDec::new_from_slices(key, &iv)
            .map_err(|e| AppError::Decryption(e.to_string()))?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| AppError::Decryption("Key does not match or data is corrupt".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| AppError::Decryption(format!("Invalid UTF-8: {}", e)))
    }

    /// Encrypt unless the value is already an envelope
    pub fn seal(&self, value: &str) -> AppResult<String> {
        if is_envelope(value) {
            Ok(value.to_string())
        } else {
            self.encrypt(value)
        }
    }

    /// Decrypt an envelope; legacy plaintext passes through
    pub fn reveal(&self, value: &str) -> AppResult<String> {
        if is_envelope(value) {
            self.decrypt(value)
        } else {
            Ok(value.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> (tempfile::TempDir, CredentialVault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::new(dir.path().join("key.dat"));
        (dir, vault)
    }

    #[test]
    fn test_round_trip_edge_values() {
        let (_dir, vault) = vault();
        for value in ["p", "", "with:colon", "a:b:c", "ünïcödé 🔑", &"x".repeat(1000)] {
            let envelope = vault.encrypt(value).unwrap();
            assert!(is_envelope(&envelope), "not an envelope: {}", envelope);
            assert_eq!(vault.decrypt(&envelope).unwrap(), value);
        }
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let (_dir, vault) = vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_file_created_once_and_reused() {
        let (dir, vault) = vault();
        let envelope = vault.encrypt("secret").unwrap();

        let key_path = dir.path().join("key.dat");
        assert_eq!(fs::read(&key_path).unwrap().len(), KEY_LEN);

        let reopened = CredentialVault::new(&key_path);
        assert_eq!(reopened.decrypt(&envelope).unwrap(), "secret");
    }

    #[test]
    fn test_foreign_key_fails_to_decrypt() {
        let (dir, vault) = vault();
        let envelope = vault.encrypt("secret value").unwrap();

        let other_path = dir.path().join("other.dat");
        fs::write(&other_path, [7u8; KEY_LEN]).unwrap();
        let other = CredentialVault::new(&other_path);

        match other.decrypt(&envelope) {
            Err(AppError::Decryption(_)) => {}
            Ok(v) => assert_ne!(v, "secret value"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_malformed_envelope() {
        let (_dir, vault) = vault();
        assert!(matches!(vault.decrypt("nothex:zz"), Err(AppError::Decryption(_))));
        assert!(matches!(vault.decrypt("plain"), Err(AppError::Decryption(_))));
    }

    #[test]
    fn test_envelope_shape() {
        let iv = "0".repeat(32);
        let ct = "a".repeat(32);
        assert!(is_envelope(&format!("{}:{}", iv, ct)));
        assert!(!is_envelope(&format!("{}:{}:{}", iv, ct, ct)));
        assert!(!is_envelope("user:password"));
        assert!(!is_envelope(&format!("{}:", iv)));
        assert!(!is_envelope("no separator"));
    }

    #[test]
    fn test_seal_is_idempotent() {
        let (_dir, vault) = vault();
        let sealed = vault.seal("hunter2").unwrap();
        assert_eq!(vault.seal(&sealed).unwrap(), sealed);
        assert_eq!(vault.reveal(&sealed).unwrap(), "hunter2");
        assert_eq!(vault.reveal("legacy-plaintext").unwrap(), "legacy-plaintext");
    }
}
