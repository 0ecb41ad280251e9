//! Encryption of credential material before it reaches the repository.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine;
use keyring::Entry;
use rand::RngCore;
use tracing::info;

use crate::config::SecuritySettings;
use crate::error::SyncError;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SyncError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, SyncError>;
}

/// AES-256-GCM with a random nonce per value; output is base64(nonce || ct).
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    pub fn new(key: &[u8; KEY_BYTES]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn from_base64_key(encoded: &str) -> Result<Self, SyncError> {
        Ok(Self::new(&decode_key(encoded)?))
    }

    /// Key from config when present, otherwise from (or into) the OS keyring.
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self, SyncError> {
        if let Some(encoded) = &settings.encryption_key {
            return Self::from_base64_key(encoded);
        }
        let entry = Entry::new(&settings.keyring_service, &settings.keyring_user)
            .map_err(|e| SyncError::Crypto(format!("keyring unavailable: {}", e)))?;
        let key = load_or_create_key(&entry)?;
        Ok(Self::new(&key))
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String, SyncError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SyncError::Crypto("encryption failed".to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(envelope))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, SyncError> {
        let envelope = STANDARD
            .decode(ciphertext)
            .map_err(|e| SyncError::Crypto(format!("ciphertext is not base64: {}", e)))?;
        if envelope.len() <= NONCE_BYTES {
            return Err(SyncError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce_bytes, body) = envelope.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| SyncError::Crypto("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| SyncError::Crypto("plaintext is not utf-8".to_string()))
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_BYTES], SyncError> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SyncError::Crypto(format!("encryption key is not base64: {}", e)))?;
    raw.try_into()
        .map_err(|_| SyncError::Crypto(format!("encryption key must be {} bytes", KEY_BYTES)))
}

// Keyring seam so key handling can be tested without an OS keyring.
#[cfg_attr(test, mockall::automock)]
pub trait KeyringEntry: Send + Sync {
    fn get_password(&self) -> Result<String, keyring::Error>;
    fn set_password(&self, password: &str) -> Result<(), keyring::Error>;
    fn delete_password(&self) -> Result<(), keyring::Error>;
}

impl KeyringEntry for Entry {
    fn get_password(&self) -> Result<String, keyring::Error> {
        self.get_password()
    }
    fn set_password(&self, password: &str) -> Result<(), keyring::Error> {
        self.set_password(password)
    }
    fn delete_password(&self) -> Result<(), keyring::Error> {
        self.delete_password()
    }
}

pub fn load_or_create_key<K: KeyringEntry>(entry: &K) -> Result<[u8; KEY_BYTES], SyncError> {
    match entry.get_password() {
        Ok(encoded) => decode_key(&encoded),
        Err(keyring::Error::NoEntry) => {
            let mut key = [0u8; KEY_BYTES];
            rand::thread_rng().fill_bytes(&mut key);
            entry
                .set_password(&STANDARD.encode(key))
                .map_err(|e| SyncError::Crypto(format!("failed to store key: {}", e)))?;
            info!("generated a new credential encryption key in the keyring");
            Ok(key)
        }
        Err(e) => Err(SyncError::Crypto(format!("failed to read key: {}", e))),
    }
}

/// Remove the keyring-held key. Stored credentials become unreadable.
pub fn clear_stored_key(settings: &SecuritySettings) -> Result<(), SyncError> {
    let entry = Entry::new(&settings.keyring_service, &settings.keyring_user)
        .map_err(|e| SyncError::Crypto(format!("keyring unavailable: {}", e)))?;
    clear_key(&entry)
}

fn clear_key<K: KeyringEntry>(entry: &K) -> Result<(), SyncError> {
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(SyncError::Crypto(format!("failed to delete key: {}", e))),
    }
}
