//! Persisted chat records
//!
//! Field names serialize in camelCase and instants as ISO-8601 strings, the
//! layout already found in existing stores.

use crate::crypto::CipherCodec;
use crate::error::StorageResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single chat message as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub is_user: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// New message with a fresh id, stamped now
    pub fn new(text: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            is_user,
            timestamp: Utc::now(),
        }
    }
}

/// Storage metadata attached to every stored message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

/// A message as it sits inside a chunk
///
/// When encrypted, `text` is empty and `encrypted_content` holds the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChatMessage {
    pub id: String,
    pub text: String,
    pub is_user: bool,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    pub metadata: MessageMetadata,
}

impl StoredChatMessage {
    /// Wrap a message for storage, clearing plaintext when the codec is active
    pub fn seal(message: &ChatMessage, session_id: &str, codec: &CipherCodec) -> Self {
        let encrypted = codec.is_active();
        let (text, encrypted_content) = if encrypted {
            (String::new(), Some(codec.encrypt(&message.text)))
        } else {
            (message.text.clone(), None)
        };

        Self {
            id: message.id.clone(),
            text,
            is_user: message.is_user,
            timestamp: message.timestamp,
            session_id: session_id.to_string(),
            encrypted_content,
            metadata: MessageMetadata {
                encrypted,
                ..Default::default()
            },
        }
    }

    /// Recover the caller-facing message with plaintext text
    pub fn open(self, codec: &CipherCodec) -> StorageResult<ChatMessage> {
        let text = match (self.metadata.encrypted, self.encrypted_content) {
            (true, Some(token)) => codec.decrypt(&token)?,
            _ => self.text,
        };

        Ok(ChatMessage {
            id: self.id,
            text,
            is_user: self.is_user,
            timestamp: self.timestamp,
        })
    }
}

/// A named conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: u64,
    pub archived: bool,
}

impl ChatSession {
    /// Fresh, empty session; defaults the name to `Chat <date>`
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("Chat {}", now.format("%Y-%m-%d")),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            name,
            created_at: now,
            last_message_at: now,
            message_count: 0,
            archived: false,
        }
    }
}

/// A bounded, independently encrypted batch of one session's messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunk {
    pub id: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Cipher token of the JSON array of `StoredChatMessage`
    pub encrypted_messages: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatChunk {
    pub fn new(session_id: &str, chunk_index: u32, codec: &CipherCodec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            chunk_index,
            total_chunks: chunk_index + 1,
            encrypted_messages: codec.encrypt("[]"),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;

    #[test]
    fn test_session_json_layout() {
        let session = ChatSession::new(Some("Morning check-in"));
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["name"], "Morning check-in");
        assert_eq!(json["messageCount"], 0);
        assert_eq!(json["archived"], false);
        assert!(json["createdAt"].as_str().unwrap().contains('T'));
        assert!(json.get("lastMessageAt").is_some());
    }

    #[test]
    fn test_default_session_name() {
        let session = ChatSession::new(None);
        assert!(session.name.starts_with("Chat "));
        assert_eq!(session.created_at, session.last_message_at);
    }

    #[test]
    fn test_reads_existing_session_record() {
        let raw = r#"{"id":"s1","name":"Chat","createdAt":"2024-03-01T10:00:00.000Z",
            "lastMessageAt":"2024-03-02T11:30:00.000Z","messageCount":4,"archived":true}"#;
        let session: ChatSession = serde_json::from_str(raw).unwrap();

        assert_eq!(session.message_count, 4);
        assert!(session.archived);
        assert!(session.last_message_at > session.created_at);
    }

    #[test]
    fn test_seal_and_open_encrypted() {
        let codec = CipherCodec::new(Some(EncryptionKey::generate()));
        let message = ChatMessage::new("I slept badly", true);

        let stored = StoredChatMessage::seal(&message, "s1", &codec);
        assert!(stored.text.is_empty());
        assert!(stored.metadata.encrypted);
        assert!(stored.encrypted_content.is_some());

        let json = serde_json::to_string(&stored).unwrap();
        assert!(!json.contains("slept"));
        assert!(json.contains("encryptedContent"));
        assert!(json.contains("sessionId"));

        assert_eq!(stored.open(&codec).unwrap(), message);
    }

    #[test]
    fn test_seal_and_open_plaintext() {
        let codec = CipherCodec::passthrough();
        let message = ChatMessage::new("hello", false);

        let stored = StoredChatMessage::seal(&message, "s1", &codec);
        assert_eq!(stored.text, "hello");
        assert!(!stored.metadata.encrypted);
        assert!(stored.encrypted_content.is_none());

        let json = serde_json::to_string(&stored).unwrap();
        assert!(!json.contains("encryptedContent"));
        assert!(!json.contains("chunkIndex"));

        assert_eq!(stored.open(&codec).unwrap(), message);
    }

    #[test]
    fn test_new_chunk_holds_empty_array() {
        let codec = CipherCodec::new(Some(EncryptionKey::generate()));
        let chunk = ChatChunk::new("s1", 2, &codec);

        assert_eq!(chunk.total_chunks, 3);
        assert_eq!(codec.decrypt(&chunk.encrypted_messages).unwrap(), "[]");
    }
}
