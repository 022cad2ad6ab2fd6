//! Key backing stores
//!
//! Two places can hold the key:
//! - [`SecureBackingStore`]: a dedicated keystore directory, files `0600`
//! - [`ObfuscatedFallbackStore`]: the general record store, with the key
//!   wrapped as `sim_key_<hex>_<hex millis>` so it is never stored bare
//!
//! A stored value that fails to parse is reported as absent, which makes
//! the key manager regenerate and overwrite it.

use super::keys::{is_valid_hex_key, EncryptionKey};
use crate::error::StorageResult;
use crate::kv::KvStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::warn;
use zeroize::Zeroizing;

/// Alias used by the secure keystore
pub const SECURE_KEY_ALIAS: &str = "chat_encryption_key";

/// Alias used by the fallback store
pub const FALLBACK_KEY_ALIAS: &str = "encrypted_chat_key_fallback";

/// Prefix of an obfuscated fallback value
const OBFUSCATION_PREFIX: &str = "sim_key_";

/// Capability interface over a place that can hold the key
#[async_trait]
pub trait KeyBackingStore: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether this store can be used on this platform right now
    async fn is_available(&self) -> bool;

    /// Load the key; `None` when absent or corrupt
    async fn load(&self) -> StorageResult<Option<EncryptionKey>>;

    /// Persist the key under this store's alias
    async fn store(&self, key: &EncryptionKey) -> StorageResult<()>;

    /// Remove the alias; removing an absent key is not an error
    async fn delete(&self) -> StorageResult<()>;
}

/// Directory-based secure keystore
pub struct SecureBackingStore {
    /// `None` when the platform offers no secure keystore
    base_path: Option<PathBuf>,
    alias: String,
}

impl SecureBackingStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: Some(base_path.into()),
            alias: SECURE_KEY_ALIAS.to_string(),
        }
    }

    /// A keystore that always reports itself unavailable
    pub fn unavailable() -> Self {
        Self {
            base_path: None,
            alias: SECURE_KEY_ALIAS.to_string(),
        }
    }

    fn key_path(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.key", self.alias))
    }
}

#[async_trait]
impl KeyBackingStore for SecureBackingStore {
    fn name(&self) -> &'static str {
        "secure-keystore"
    }

    async fn is_available(&self) -> bool {
        match &self.base_path {
            Some(base) => fs::create_dir_all(base).await.is_ok(),
            None => false,
        }
    }

    async fn load(&self) -> StorageResult<Option<EncryptionKey>> {
        let Some(base) = &self.base_path else {
            return Ok(None);
        };

        let contents = match fs::read_to_string(self.key_path(base)).await {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let key = EncryptionKey::from_hex(contents.trim());
        if key.is_none() {
            warn!(store = self.name(), "Stored key is corrupt, it will be regenerated");
        }
        Ok(key)
    }

    async fn store(&self, key: &EncryptionKey) -> StorageResult<()> {
        let Some(base) = &self.base_path else {
            return Err(std::io::Error::new(
                ErrorKind::Unsupported,
                "secure keystore unavailable",
            )
            .into());
        };

        fs::create_dir_all(base).await?;
        let path = self.key_path(base);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, key.as_hex()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self) -> StorageResult<()> {
        let Some(base) = &self.base_path else {
            return Ok(());
        };

        match fs::remove_file(self.key_path(base)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fallback keystore inside the general record store
pub struct ObfuscatedFallbackStore {
    kv: Arc<dyn KvStore>,
    alias: String,
}

impl ObfuscatedFallbackStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            alias: FALLBACK_KEY_ALIAS.to_string(),
        }
    }
}

/// Wrap a hex key as `sim_key_<hex>_<hex millis>`
pub fn obfuscate(key: &EncryptionKey) -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0);
    format!("{}{}_{:x}", OBFUSCATION_PREFIX, key.as_hex(), millis)
}

/// Strip the obfuscation wrapper, `None` if the format does not match
pub fn deobfuscate(value: &str) -> Option<EncryptionKey> {
    let body = value.strip_prefix(OBFUSCATION_PREFIX)?;
    let (key, suffix) = body.split_once('_')?;

    let suffix_ok = !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_hexdigit());
    if !suffix_ok || !is_valid_hex_key(key) {
        return None;
    }
    EncryptionKey::from_hex(key)
}

#[async_trait]
impl KeyBackingStore for ObfuscatedFallbackStore {
    fn name(&self) -> &'static str {
        "obfuscated-fallback"
    }

    async fn is_available(&self) -> bool {
        self.kv.get(&self.alias).await.is_ok()
    }

    async fn load(&self) -> StorageResult<Option<EncryptionKey>> {
        let Some(value) = self.kv.get(&self.alias).await? else {
            return Ok(None);
        };
        let value = Zeroizing::new(value);

        let key = deobfuscate(&value);
        if key.is_none() {
            warn!(store = self.name(), "Failed to deobfuscate stored key, it will be regenerated");
        }
        Ok(key)
    }

    async fn store(&self, key: &EncryptionKey) -> StorageResult<()> {
        let wrapped = Zeroizing::new(obfuscate(key));
        self.kv.set(&self.alias, &wrapped).await
    }

    async fn delete(&self) -> StorageResult<()> {
        self.kv.remove(&self.alias).await
    }
}
