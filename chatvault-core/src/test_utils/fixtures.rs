//! Test fixtures

use crate::store::{ChatSession, SessionStore};
use chrono::{Duration, Utc};

/// Create a session whose last activity was `days_ago` days back
pub async fn backdate_session(sessions: &SessionStore, name: &str, days_ago: i64) -> ChatSession {
    let mut session = sessions.create_session(Some(name)).await.unwrap();
    let at = Utc::now() - Duration::days(days_ago);
    session.created_at = at;
    session.last_message_at = at;
    sessions.save_session(&session).await.unwrap();
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_backdated_session_is_persisted() {
        let sessions = SessionStore::new(Arc::new(MemoryKvStore::new()));
        let session = backdate_session(&sessions, "old", 10).await;

        let stored = sessions.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.last_message_at, session.last_message_at);
        assert!(stored.last_message_at < Utc::now() - Duration::days(9));
    }
}
