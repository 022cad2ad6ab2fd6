//! Key material and the chat cipher
//!
//! - [`backing`]: where the key lives (secure keystore or obfuscated fallback)
//! - [`keys`]: key generation and acquisition across backing stores
//! - [`cipher`]: the XOR + integrity-tag token codec

pub mod backing;
pub mod cipher;
pub mod keys;

pub use backing::{KeyBackingStore, ObfuscatedFallbackStore, SecureBackingStore};
pub use cipher::CipherCodec;
pub use keys::{EncryptionKey, KeyManager};
