//! Session archival and retention
//!
//! Both passes are idempotent and best-effort: a failure on one session is
//! logged and the pass moves on to the next.

use super::chunk_store::ChunkStore;
use super::session_store::SessionStore;
use crate::metrics;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one maintenance run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub archived: usize,
    pub pruned: usize,
}

pub struct MaintenanceScheduler {
    sessions: Arc<SessionStore>,
    chunks: Arc<ChunkStore>,
}

impl MaintenanceScheduler {
    pub fn new(sessions: Arc<SessionStore>, chunks: Arc<ChunkStore>) -> Self {
        Self { sessions, chunks }
    }

    /// Archive every active session idle since before `now - archive_after_days`
    ///
    /// Returns how many sessions were newly archived.
    pub async fn archive_stale_sessions(&self, archive_after_days: u32, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(i64::from(archive_after_days));
        let mut archived = 0;

        for session in self.sessions.all_sessions().await {
            if session.archived || session.last_message_at >= cutoff {
                continue;
            }

            match self
                .sessions
                .update_session(&session.id, |s| s.archived = true)
                .await
            {
                Ok(_) => {
                    debug!(session_id = %session.id, "Archived stale session");
                    archived += 1;
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Error archiving session"),
            }
        }

        if archived > 0 {
            metrics::record_counter(metrics::SESSIONS_ARCHIVED, archived as u64);
            info!(archived, archive_after_days, "Archived stale sessions");
        }
        archived
    }

    /// Delete the oldest archived sessions beyond `max_sessions_to_keep`
    ///
    /// A pruned session loses its record, its index entry and all chunks.
    /// Both are removed under the session's chunk lock, so an append that
    /// waits on that lock finds the session gone instead of reviving it.
    pub async fn prune_archived(&self, max_sessions_to_keep: u32) -> usize {
        let mut archived: Vec<_> = self
            .sessions
            .all_sessions()
            .await
            .into_iter()
            .filter(|s| s.archived)
            .collect();

        let keep = max_sessions_to_keep as usize;
        if archived.len() <= keep {
            return 0;
        }

        archived.sort_by_key(|s| s.last_message_at);
        let excess = archived.len() - keep;
        let mut pruned = 0;

        for session in archived.into_iter().take(excess) {
            let lock = self.chunks.lock_session(&session.id).await;
            if let Err(e) = self.chunks.delete_locked(&lock).await {
                warn!(session_id = %session.id, error = %e, "Error deleting session chunks");
                continue;
            }
            match self.sessions.delete_session(&session.id).await {
                Ok(()) => {
                    debug!(session_id = %session.id, "Pruned archived session");
                    pruned += 1;
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Error deleting session"),
            }
        }

        if pruned > 0 {
            metrics::record_counter(metrics::SESSIONS_PRUNED, pruned as u64);
            info!(pruned, max_sessions_to_keep, "Pruned archived sessions");
        }
        pruned
    }

    /// Archive, then prune
    pub async fn run(&self, archive_after_days: u32, max_sessions_to_keep: u32) -> MaintenanceReport {
        let archived = self.archive_stale_sessions(archive_after_days, Utc::now()).await;
        let pruned = self.prune_archived(max_sessions_to_keep).await;
        MaintenanceReport { archived, pruned }
    }
}
