//! Key-value substrate for the pipeline's shared coordination state.
//!
//! Dedup fingerprints, open message buffers, and conversation entries all
//! live behind this seam so that webhook handlers and the flush ticker can
//! run in separate processes against a shared store. `set_nx` is the atomic
//! check-and-set the dedup guard and flush path rely on.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, replacing any existing one. `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomic set-if-absent with TTL. Returns `true` when this call created
    /// the key; `false` when a live entry already existed. Concurrent calls
    /// for the same key must hand `true` to at most one caller.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Returns `true` when a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys of all live entries under the prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store over `DashMap` with lazy TTL expiry. Expired entries are
/// dropped on read and replaced on write, so there is no sweep task; memory
/// is bounded by the live key set.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Drop the stale entry outside the read guard.
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut created = false;
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| {
            created = true;
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            }
        });
        if !created && slot.is_expired(now) {
            *slot = Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            };
            created = true;
        }
        Ok(created)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_admits_only_the_first_writer() {
        let kv = MemoryKv::new();
        let ttl = Duration::from_secs(60);
        assert!(kv.set_nx("k", "a", ttl).await.unwrap());
        assert!(!kv.set_nx("k", "b", ttl).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_entries_behave_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        // A new set_nx after expiry wins again.
        assert!(kv.set_nx("k", "v2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn scan_prefix_skips_other_namespaces() {
        let kv = MemoryKv::new();
        kv.set("buf:a", "1", None).await.unwrap();
        kv.set("buf:b", "2", None).await.unwrap();
        kv.set("dedup:a", "3", None).await.unwrap();
        let mut keys = kv.scan_prefix("buf:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["buf:a".to_string(), "buf:b".to_string()]);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_live_entry_was_removed() {
        let kv = MemoryKv::new();
        kv.set("k", "v", None).await.unwrap();
        assert!(kv.delete("k").await.unwrap());
        assert!(!kv.delete("k").await.unwrap());
    }
}
