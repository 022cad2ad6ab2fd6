//! Encryption key material and acquisition
//!
//! The key is 32 random bytes kept as 64 lowercase hex characters. The hex
//! text itself is what the cipher consumes, so tokens stay compatible with
//! data written by earlier builds.

use super::backing::KeyBackingStore;
use crate::error::{StorageError, StorageResult};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Raw key length in bytes
pub const KEY_LEN: usize = 32;

/// Symmetric key, zeroized on drop
#[derive(Clone)]
pub struct EncryptionKey {
    hex: Zeroizing<String>,
}

impl EncryptionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let bytes: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(rand::random());
        Self {
            hex: Zeroizing::new(hex::encode(&*bytes)),
        }
    }

    /// Parse a stored hex key, `None` if it is not 64 hex characters
    pub fn from_hex(hex: &str) -> Option<Self> {
        is_valid_hex_key(hex).then(|| Self {
            hex: Zeroizing::new(hex.to_ascii_lowercase()),
        })
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Bytes fed to the cipher and the integrity tag
    pub fn as_bytes(&self) -> &[u8] {
        self.hex.as_bytes()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Whether `value` is a well-formed hex-encoded 32-byte key
pub fn is_valid_hex_key(value: &str) -> bool {
    value.len() == KEY_LEN * 2 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Acquires, generates and deletes the process key
///
/// The secure store is preferred whenever it reports itself available; the
/// fallback store is used otherwise, or when the secure store fails.
pub struct KeyManager {
    secure: Arc<dyn KeyBackingStore>,
    fallback: Arc<dyn KeyBackingStore>,
    /// Store that produced the current key
    active: RwLock<Option<Arc<dyn KeyBackingStore>>>,
}

impl KeyManager {
    pub fn new(secure: Arc<dyn KeyBackingStore>, fallback: Arc<dyn KeyBackingStore>) -> Self {
        Self {
            secure,
            fallback,
            active: RwLock::new(None),
        }
    }

    /// Load the key or create one
    ///
    /// Fails with [`StorageError::KeyUnavailable`] only when every backing
    /// store failed.
    pub async fn acquire_key(&self) -> StorageResult<EncryptionKey> {
        let mut failures = Vec::new();

        if self.secure.is_available().await {
            match load_or_create(self.secure.as_ref()).await {
                Ok(key) => {
                    info!(store = self.secure.name(), "Encryption key ready");
                    *self.active.write().await = Some(self.secure.clone());
                    return Ok(key);
                }
                Err(e) => {
                    warn!(store = self.secure.name(), error = %e, "Secure key store failed, trying fallback");
                    failures.push(format!("{}: {}", self.secure.name(), e));
                }
            }
        } else {
            debug!(store = self.secure.name(), "Secure key store unavailable");
        }

        match load_or_create(self.fallback.as_ref()).await {
            Ok(key) => {
                info!(store = self.fallback.name(), "Encryption key ready");
                *self.active.write().await = Some(self.fallback.clone());
                Ok(key)
            }
            Err(e) => {
                failures.push(format!("{}: {}", self.fallback.name(), e));
                Err(StorageError::KeyUnavailable(failures.join("; ")))
            }
        }
    }

    /// Remove the key from whichever store produced it
    ///
    /// No-op when no key was acquired (encryption disabled).
    pub async fn delete_key(&self) -> StorageResult<()> {
        let Some(store) = self.active.write().await.take() else {
            debug!("No active key store, nothing to delete");
            return Ok(());
        };

        store.delete().await?;
        info!(store = store.name(), "Encryption key deleted");
        Ok(())
    }

    /// Name of the store holding the current key, if any
    pub async fn active_store(&self) -> Option<&'static str> {
        self.active.read().await.as_ref().map(|s| s.name())
    }
}

async fn load_or_create(store: &dyn KeyBackingStore) -> StorageResult<EncryptionKey> {
    if let Some(key) = store.load().await? {
        return Ok(key);
    }

    info!(store = store.name(), "Generating new encryption key");
    let key = EncryptionKey::generate();
    store.store(&key).await?;
    Ok(key)
}
