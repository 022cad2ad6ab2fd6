/*
    cipher.rs - Token codec for chat payloads

    Token format: "<hex ciphertext>:<tag16>"
    - ciphertext = UTF-8 plaintext XOR key bytes (key repeated cyclically)
    - tag16      = first 16 hex chars of SHA-256(plaintext || key)

    This is obfuscation with a corruption check, not authenticated
    encryption: the tag is verified on decrypt but a mismatch only logs.
    Replacing the cipher changes the stored format and needs a versioned
    migration of every chunk.
*/

use super::keys::EncryptionKey;
use crate::error::{StorageError, StorageResult};
use crate::metrics;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Separator between ciphertext and integrity tag
pub const TAG_SEPARATOR: char = ':';

/// Hex characters of the hash kept as the tag
pub const TAG_LEN: usize = 16;

/// Encrypts/decrypts payloads with an optional key
///
/// Without a key both directions are the identity function.
#[derive(Clone, Debug, Default)]
pub struct CipherCodec {
    key: Option<EncryptionKey>,
}

impl CipherCodec {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self { key }
    }

    /// Codec that passes plaintext through unchanged
    pub fn passthrough() -> Self {
        Self { key: None }
    }

    /// Whether payloads are actually transformed
    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        match &self.key {
            Some(key) => encrypt(plaintext, key),
            None => plaintext.to_string(),
        }
    }

    pub fn decrypt(&self, token: &str) -> StorageResult<String> {
        match &self.key {
            Some(key) => decrypt(token, key),
            None => Ok(token.to_string()),
        }
    }
}

/// Encrypt `plaintext` into a token
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> String {
    let key_bytes = key.as_bytes();
    let ciphertext = xor_cycle(plaintext.as_bytes(), key_bytes);
    let tag = integrity_tag(plaintext.as_bytes(), key_bytes);

    format!("{}{}{}", hex::encode(ciphertext), TAG_SEPARATOR, tag)
}

/// Decrypt a token
///
/// Fails only when the token is malformed. A tag mismatch (wrong key or
/// corruption) is logged and the recovered plaintext is still returned.
pub fn decrypt(token: &str, key: &EncryptionKey) -> StorageResult<String> {
    let parts: Vec<&str> = token.split(TAG_SEPARATOR).collect();
    let [cipher_hex, provided_tag] = parts.as_slice() else {
        return Err(StorageError::Decrypt("malformed token".to_string()));
    };

    let ciphertext = hex::decode(cipher_hex)
        .map_err(|e| StorageError::Decrypt(format!("invalid ciphertext hex: {}", e)))?;

    let key_bytes = key.as_bytes();
    let recovered = xor_cycle(&ciphertext, key_bytes);
    let plaintext = String::from_utf8_lossy(&recovered).into_owned();

    let expected_tag = integrity_tag(plaintext.as_bytes(), key_bytes);
    if expected_tag != *provided_tag {
        metrics::record_counter(metrics::INTEGRITY_MISMATCH, 1);
        warn!("Integrity tag mismatch, data may be corrupted");
    }

    Ok(plaintext)
}

fn xor_cycle(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect()
}

fn integrity_tag(plaintext: &[u8], key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext);
    hasher.update(key);
    let digest = hex::encode(hasher.finalize());
    digest[..TAG_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_key(c: char) -> EncryptionKey {
        EncryptionKey::from_hex(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn test_token_format() {
        let key = EncryptionKey::generate();
        let token = encrypt("hello", &key);

        let (cipher_hex, tag) = token.split_once(':').unwrap();
        assert_eq!(cipher_hex.len(), "hello".len() * 2);
        assert_eq!(tag.len(), TAG_LEN);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_known_vector() {
        // 'h' (0x68) ^ '0' (0x30) = 0x58, 'i' (0x69) ^ '0' = 0x59
        let key = fixed_key('0');
        let token = encrypt("hi", &key);
        assert!(token.starts_with("5859:"));

        let expected = hex::encode(Sha256::digest(format!("hi{}", "0".repeat(64))));
        assert_eq!(token, format!("5859:{}", &expected[..16]));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = EncryptionKey::generate();
        let plaintext = r#"[{"id":"1","text":"Hello, World! ünïcödé"}]"#;
        let token = encrypt(plaintext, &key);

        assert!(!token.contains("Hello"));
        assert_eq!(decrypt(&token, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = EncryptionKey::generate();
        let token = encrypt("", &key);
        assert!(token.starts_with(':'));
        assert_eq!(decrypt(&token, &key).unwrap(), "");
    }

    #[test]
    fn test_malformed_token() {
        let key = EncryptionKey::generate();

        let no_separator = decrypt("abcdef", &key);
        assert!(matches!(no_separator, Err(StorageError::Decrypt(msg)) if msg.contains("malformed")));

        let too_many = decrypt("ab:cd:ef", &key);
        assert!(matches!(too_many, Err(StorageError::Decrypt(_))));

        let bad_hex = decrypt("zz:0123456789abcdef", &key);
        assert!(matches!(bad_hex, Err(StorageError::Decrypt(_))));
    }

    #[test]
    fn test_tag_mismatch_still_returns_plaintext() {
        let key = EncryptionKey::generate();
        let token = encrypt("payload", &key);
        let (cipher_hex, _) = token.split_once(':').unwrap();
        let tampered = format!("{}:0000000000000000", cipher_hex);

        assert_eq!(decrypt(&tampered, &key).unwrap(), "payload");
    }

    #[test]
    fn test_passthrough_codec() {
        let codec = CipherCodec::passthrough();
        assert!(!codec.is_active());
        assert_eq!(codec.encrypt("plain:text"), "plain:text");
        assert_eq!(codec.decrypt("plain:text:more").unwrap(), "plain:text:more");
    }

    #[test]
    fn test_active_codec() {
        let codec = CipherCodec::new(Some(EncryptionKey::generate()));
        assert!(codec.is_active());
        let token = codec.encrypt("[]");
        assert_ne!(token, "[]");
        assert_eq!(codec.decrypt(&token).unwrap(), "[]");
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in ".*") {
            let key = EncryptionKey::generate();
            prop_assert_eq!(decrypt(&encrypt(&plaintext, &key), &key).unwrap(), plaintext);
        }

        #[test]
        fn prop_wrong_key_never_fails(plaintext in "[a-zA-Z0-9 ]{1,64}") {
            let right = fixed_key('1');
            let wrong = fixed_key('2');
            let token = encrypt(&plaintext, &right);

            let recovered = decrypt(&token, &wrong).unwrap();
            prop_assert_ne!(recovered, plaintext);
        }
    }
}
