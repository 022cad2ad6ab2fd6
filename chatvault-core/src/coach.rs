//! Coach conversation loop
//!
//! A [`CoachSession`] stores the user's message, asks a
//! [`ResponseGenerator`] for a reply given the recent conversation, and
//! stores the reply. Generating text is the collaborator's job; this module
//! only sequences it against storage.

use crate::error::StorageError;
use crate::facade::{render_context, ChatStorage};
use crate::store::ChatMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Messages of history handed to the generator by default
pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Error)]
pub enum CoachError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The generator failed; the user message is already stored
    #[error("Response generation failed: {0}")]
    Generation(String),
}

/// Produces coach replies
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// `history` holds `User: ...` / `Coach: ...` lines, oldest first,
    /// not including `user_message`
    async fn generate(&self, user_message: &str, history: &[String]) -> Result<String, CoachError>;
}

/// A user message and the reply it produced
#[derive(Debug, Clone)]
pub struct CoachExchange {
    pub user: ChatMessage,
    pub reply: ChatMessage,
}

pub struct CoachSession {
    storage: Arc<ChatStorage>,
    generator: Arc<dyn ResponseGenerator>,
    context_messages: usize,
}

impl CoachSession {
    pub fn new(storage: Arc<ChatStorage>, generator: Arc<dyn ResponseGenerator>) -> Self {
        Self {
            storage,
            generator,
            context_messages: DEFAULT_CONTEXT_MESSAGES,
        }
    }

    pub fn with_context_messages(mut self, count: usize) -> Self {
        self.context_messages = count;
        self
    }

    /// Store `text`, generate a reply from recent history and store it
    pub async fn respond(&self, text: &str) -> Result<CoachExchange, CoachError> {
        let history = render_context(&self.storage.get_recent_messages(self.context_messages).await?);
        let user = self.storage.add_user_message(text).await?;

        let reply_text = match self.generator.generate(text, &history).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(message_id = %user.id, error = %e, "Coach reply failed");
                return Err(e);
            }
        };

        let reply = self.storage.add_coach_response(&reply_text).await?;
        debug!(history = history.len(), "Coach replied");
        Ok(CoachExchange { user, reply })
    }
}
