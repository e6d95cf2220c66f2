//! Short-term coordination state per conversation.
//!
//! Entries are transient: expiry only resets the coordination slots (open
//! buffer marker, open job id, turn counter), never any durable history, so
//! a conversation that goes quiet starts its next buffer cleanly. Fields are
//! last-writer-wins; each field has a single writer role (buffer opens,
//! dispatcher sets the job id, the terminal-state path clears it).

use crate::error::Result;
use crate::kv::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warung_channels::ConversationKey;

const CONVO_KEY_PREFIX: &str = "convo:";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub last_flush_at: Option<DateTime<Utc>>,
    pub buffer_open_since: Option<DateTime<Utc>>,
    pub open_job_id: Option<Uuid>,
    pub turns: u64,
}

pub struct ConversationCache {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ConversationCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn storage_key(key: &ConversationKey) -> String {
        format!("{CONVO_KEY_PREFIX}{}", key.cache_token())
    }

    pub async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationEntry>> {
        match self.kv.get(&Self::storage_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load the entry (default if absent), apply the mutation, and write it
    /// back with a refreshed sliding TTL.
    async fn update<F>(&self, key: &ConversationKey, mutate: F) -> Result<ConversationEntry>
    where
        F: FnOnce(&mut ConversationEntry),
    {
        let mut entry = self.get(key).await?.unwrap_or_default();
        mutate(&mut entry);
        self.kv
            .set(
                &Self::storage_key(key),
                &serde_json::to_string(&entry)?,
                Some(self.ttl),
            )
            .await?;
        Ok(entry)
    }

    /// Extend the TTL without changing any field.
    pub async fn touch(&self, key: &ConversationKey) -> Result<()> {
        self.update(key, |_| {}).await?;
        Ok(())
    }

    pub async fn note_buffer_opened(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.update(key, |entry| {
            if entry.buffer_open_since.is_none() {
                entry.buffer_open_since = Some(now);
            }
        })
        .await?;
        Ok(())
    }

    /// Record a completed flush: closes the buffer marker and counts a turn.
    pub async fn note_flush(&self, key: &ConversationKey, now: DateTime<Utc>) -> Result<u64> {
        let entry = self
            .update(key, |entry| {
                entry.last_flush_at = Some(now);
                entry.buffer_open_since = None;
                entry.turns += 1;
            })
            .await?;
        Ok(entry.turns)
    }

    pub async fn set_open_job(&self, key: &ConversationKey, job_id: Uuid) -> Result<()> {
        self.update(key, |entry| {
            entry.open_job_id = Some(job_id);
        })
        .await?;
        Ok(())
    }

    /// Clear the open-job slot if it still points at `job_id`. A newer job
    /// dispatched while the old one's notification was in flight keeps its
    /// slot.
    pub async fn clear_job(&self, key: &ConversationKey, job_id: Uuid) -> Result<()> {
        self.update(key, |entry| {
            if entry.open_job_id == Some(job_id) {
                entry.open_job_id = None;
            }
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn cache() -> ConversationCache {
        ConversationCache::new(Arc::new(MemoryKv::new()), Duration::from_secs(60))
    }

    fn key() -> ConversationKey {
        ConversationKey::parse("acme", "628123@c.us").unwrap()
    }

    #[tokio::test]
    async fn flush_closes_buffer_marker_and_counts_turns() {
        let cache = cache();
        let key = key();
        let now = Utc::now();

        cache.note_buffer_opened(&key, now).await.unwrap();
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.buffer_open_since, Some(now));
        assert_eq!(entry.turns, 0);

        assert_eq!(cache.note_flush(&key, now).await.unwrap(), 1);
        assert_eq!(cache.note_flush(&key, now).await.unwrap(), 2);
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert!(entry.buffer_open_since.is_none());
        assert_eq!(entry.last_flush_at, Some(now));
    }

    #[tokio::test]
    async fn buffer_open_marker_keeps_first_timestamp() {
        let cache = cache();
        let key = key();
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(5);

        cache.note_buffer_opened(&key, first).await.unwrap();
        cache.note_buffer_opened(&key, later).await.unwrap();
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.buffer_open_since, Some(first));
    }

    #[tokio::test]
    async fn clear_job_only_clears_its_own_id() {
        let cache = cache();
        let key = key();
        let old_job = Uuid::new_v4();
        let new_job = Uuid::new_v4();

        cache.set_open_job(&key, old_job).await.unwrap();
        cache.set_open_job(&key, new_job).await.unwrap();

        // Stale clear from the old job's notification is a no-op.
        cache.clear_job(&key, old_job).await.unwrap();
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.open_job_id, Some(new_job));

        cache.clear_job(&key, new_job).await.unwrap();
        let entry = cache.get(&key).await.unwrap().unwrap();
        assert!(entry.open_job_id.is_none());
    }

    #[tokio::test]
    async fn entries_are_created_lazily() {
        let cache = cache();
        assert!(cache.get(&key()).await.unwrap().is_none());
        cache.touch(&key()).await.unwrap();
        assert!(cache.get(&key()).await.unwrap().is_some());
    }
}
