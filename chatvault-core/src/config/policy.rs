//! Storage policy and its persistence

use crate::error::{StorageError, StorageResult};
use crate::kv::{keys, KvStore};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, warn};

const MESSAGES_PER_CHUNK_RANGE: RangeInclusive<u32> = 1..=1000;
const SESSIONS_TO_KEEP_RANGE: RangeInclusive<u32> = 1..=100;
const ARCHIVE_AFTER_DAYS_RANGE: RangeInclusive<u32> = 1..=365;

/// Tunable storage policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Capacity of one chunk
    pub max_messages_per_chunk: u32,
    /// Archived sessions retained before pruning
    pub max_sessions_to_keep: u32,
    /// Inactivity window before a session is archived
    pub archive_after_days: u32,
    pub encryption_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_messages_per_chunk: 100,
            max_sessions_to_keep: 10,
            archive_after_days: 30,
            encryption_enabled: true,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> StorageResult<()> {
        check_range(
            "maxMessagesPerChunk",
            self.max_messages_per_chunk,
            MESSAGES_PER_CHUNK_RANGE,
        )?;
        check_range(
            "maxSessionsToKeep",
            self.max_sessions_to_keep,
            SESSIONS_TO_KEEP_RANGE,
        )?;
        check_range(
            "archiveAfterDays",
            self.archive_after_days,
            ARCHIVE_AFTER_DAYS_RANGE,
        )?;
        Ok(())
    }

    /// Apply a partial update, returning the merged config
    pub fn merged(&self, update: &StorageConfigUpdate) -> Self {
        Self {
            max_messages_per_chunk: update
                .max_messages_per_chunk
                .unwrap_or(self.max_messages_per_chunk),
            max_sessions_to_keep: update
                .max_sessions_to_keep
                .unwrap_or(self.max_sessions_to_keep),
            archive_after_days: update.archive_after_days.unwrap_or(self.archive_after_days),
            encryption_enabled: update.encryption_enabled.unwrap_or(self.encryption_enabled),
        }
    }
}

fn check_range(field: &str, value: u32, range: RangeInclusive<u32>) -> StorageResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(StorageError::ConfigValidation(format!(
            "{} must be between {} and {}, got {}",
            field,
            range.start(),
            range.end(),
            value
        )))
    }
}

/// Partial config update; `None` fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages_per_chunk: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions_to_keep: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_after_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_enabled: Option<bool>,
}

/// Loads and persists the `config` record
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
}

impl ConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Load the stored config
    ///
    /// Missing, unreadable or out-of-range records fall back to defaults.
    pub async fn load(&self) -> StorageConfig {
        let raw = match self.kv.get(keys::CONFIG).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No stored config, using defaults");
                return StorageConfig::default();
            }
            Err(e) => {
                warn!(error = %e, "Error loading config, using defaults");
                return StorageConfig::default();
            }
        };

        let parsed = serde_json::from_str::<StorageConfig>(&raw)
            .map_err(StorageError::from)
            .and_then(|config| config.validate().map(|_| config));

        match parsed {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Invalid stored config, using defaults");
                StorageConfig::default()
            }
        }
    }

    /// Merge, validate, then persist
    ///
    /// On validation failure nothing is written and the caller keeps
    /// `current`.
    pub async fn update(
        &self,
        current: &StorageConfig,
        update: &StorageConfigUpdate,
    ) -> StorageResult<StorageConfig> {
        let merged = current.merged(update);
        merged.validate()?;

        self.kv
            .set(keys::CONFIG, &serde_json::to_string(&merged)?)
            .await?;
        Ok(merged)
    }

    pub async fn clear(&self) -> StorageResult<()> {
        self.kv.remove(keys::CONFIG).await
    }
}
