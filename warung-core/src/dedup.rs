//! Deduplication guard for provider webhook retries.
//!
//! WhatsApp providers redeliver webhook events aggressively; the guard
//! admits each fingerprint exactly once per TTL window via an atomic
//! set-if-absent on the shared store.

use crate::error::Result;
use crate::kv::KeyValueStore;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use warung_channels::{ConversationKey, InboundEvent};

/// Timestamp bucket width for hash-derived fingerprints. Wide enough that a
/// retried delivery of the same text lands in the same bucket, narrow enough
/// that a genuinely repeated message minutes later is admitted.
const HASH_BUCKET_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the dedup fingerprint for an inbound event: the provider
    /// message id when present, otherwise a hash of (chat identity, text,
    /// coarse timestamp bucket).
    pub fn from_event(event: &InboundEvent) -> Self {
        if let Some(id) = &event.event_id {
            if !id.as_str().trim().is_empty() {
                return Self(format!(
                    "{}:{}",
                    sanitize(event.conversation.cache_token().as_str()),
                    sanitize(id.as_str())
                ));
            }
        }
        Self::from_content(&event.conversation, &event.text, event.received_at)
    }

    fn from_content(key: &ConversationKey, text: &str, at: DateTime<Utc>) -> Self {
        let bucket = at.timestamp().div_euclid(HASH_BUCKET_SECONDS);
        let mut hasher = Sha256::new();
        hasher.update(key.cache_token().as_bytes());
        hasher.update([0]);
        hasher.update(text.as_bytes());
        hasher.update([0]);
        hasher.update(bucket.to_be_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint for an outbound job notification, keyed by job id, so the
    /// outbound publisher can suppress double sends on replay.
    pub fn for_job_delivery(job_id: uuid::Uuid) -> Self {
        Self(format!("job:{job_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize(raw: &str) -> String {
    raw.replace([' ', ':'], "-")
}

pub struct DedupGuard {
    kv: Arc<dyn KeyValueStore>,
    key_prefix: &'static str,
    ttl: Duration,
    enabled: bool,
}

impl DedupGuard {
    pub fn new(kv: Arc<dyn KeyValueStore>, key_prefix: &'static str, ttl: Duration) -> Self {
        Self {
            kv,
            key_prefix,
            ttl,
            enabled: true,
        }
    }

    pub fn disabled(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            key_prefix: "dedup:",
            ttl: Duration::from_secs(1),
            enabled: false,
        }
    }

    /// Record the fingerprint and return `true` the first time it is seen
    /// within the TTL window. Race losers get `false`; a disabled guard
    /// admits everything.
    pub async fn admit(&self, fingerprint: &Fingerprint) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let key = format!("{}{}", self.key_prefix, fingerprint.as_str());
        let admitted = self.kv.set_nx(&key, "1", self.ttl).await?;
        if !admitted {
            tracing::info!(fingerprint = %fingerprint, "duplicate delivery dropped");
        }
        Ok(admitted)
    }

    /// Forget an admitted fingerprint. Used when the work behind the
    /// admission failed before taking effect, so a retried delivery is not
    /// mistaken for a duplicate of work that never happened.
    pub async fn release(&self, fingerprint: &Fingerprint) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let key = format!("{}{}", self.key_prefix, fingerprint.as_str());
        self.kv.delete(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use warung_channels::MessageId;

    fn event(id: Option<&str>, text: &str, at: DateTime<Utc>) -> InboundEvent {
        InboundEvent {
            event_id: id.map(MessageId::new),
            conversation: ConversationKey::parse("acme", "628123@c.us").unwrap(),
            text: text.to_string(),
            from_me: false,
            received_at: at,
        }
    }

    #[tokio::test]
    async fn same_provider_message_id_is_admitted_once() {
        let guard = DedupGuard::new(
            Arc::new(MemoryKv::new()),
            "dedup:",
            Duration::from_secs(300),
        );
        let now = Utc::now();
        let fp = Fingerprint::from_event(&event(Some("abc123"), "hi", now));

        assert!(guard.admit(&fp).await.unwrap());
        assert!(!guard.admit(&fp).await.unwrap());
        assert!(!guard.admit(&fp).await.unwrap());
    }

    #[test]
    fn missing_event_id_falls_back_to_content_hash() {
        let now = Utc::now();
        let a = Fingerprint::from_event(&event(None, "hi", now));
        let b = Fingerprint::from_event(&event(None, "hi", now));
        let c = Fingerprint::from_event(&event(None, "bye", now));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn content_hash_changes_across_time_buckets() {
        let at = DateTime::parse_from_rfc3339("2025-01-01T10:00:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = at + chrono::Duration::seconds(HASH_BUCKET_SECONDS * 2);
        let a = Fingerprint::from_event(&event(None, "hi", at));
        let b = Fingerprint::from_event(&event(None, "hi", later));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn disabled_guard_admits_everything() {
        let guard = DedupGuard::disabled(Arc::new(MemoryKv::new()));
        let fp = Fingerprint::from_event(&event(Some("abc123"), "hi", Utc::now()));
        assert!(guard.admit(&fp).await.unwrap());
        assert!(guard.admit(&fp).await.unwrap());
    }
}
