//! Per-conversation debounce buffer.
//!
//! A customer typing several quick bubbles produces several webhook calls:
//!
//!   "Halo"            ─┐
//!   "Saya mau order"   ├─► buffer (quiet period) ─► one combined prompt
//!   "Produk A 2 pcs"  ─┘
//!
//! Fragments accumulate per conversation key while the debounce window is
//! open. Each new fragment extends the deadline up to a hard cap from first
//! arrival; fragment-count and character caps force an immediate flush. The
//! stored deadline is polled by the flush worker, so the design survives a
//! crash between fragments.

use crate::error::{PipelineError, Result};
use crate::kv::KeyValueStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use warung_channels::{ConversationKey, MessageId};

const BUFFER_KEY_PREFIX: &str = "buf:";

/// Grace added to the stored entry's TTL past its flush deadline, covering
/// flush-worker downtime before the entry silently expires.
const BUFFER_TTL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Quiet period after the first fragment.
    pub initial_delay: Duration,
    /// Deadline extension granted by each subsequent fragment.
    pub extend_delay: Duration,
    /// Hard cap on total buffering time from first arrival.
    pub max_delay: Duration,
    /// Fragment-count cap; reaching it flushes immediately.
    pub max_fragments: usize,
    /// Total-character cap across fragment texts; reaching it flushes immediately.
    pub max_chars: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            extend_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            max_fragments: 20,
            max_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fragment {
    text: String,
    received_at: DateTime<Utc>,
    event_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BufferState {
    conversation: ConversationKey,
    fragments: Vec<Fragment>,
    first_arrival: DateTime<Utc>,
    flush_at: DateTime<Utc>,
}

impl BufferState {
    fn total_chars(&self) -> usize {
        self.fragments.iter().map(|f| f.text.chars().count()).sum()
    }

    fn into_flushed(self) -> FlushedPrompt {
        let prompt = self
            .fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let event_ids = self
            .fragments
            .iter()
            .filter_map(|f| f.event_id.clone())
            .collect();
        FlushedPrompt {
            conversation: self.conversation,
            prompt,
            event_ids,
            fragment_count: self.fragments.len(),
            first_arrival: self.first_arrival,
        }
    }
}

/// A closed buffer: the newline-joined prompt in arrival order plus the
/// consumed provider event ids for downstream traceability.
#[derive(Debug, Clone)]
pub struct FlushedPrompt {
    pub conversation: ConversationKey,
    pub prompt: String,
    pub event_ids: Vec<MessageId>,
    pub fragment_count: usize,
    pub first_arrival: DateTime<Utc>,
}

#[derive(Debug)]
pub enum BufferDecision {
    /// Fragment stored; the debounce window is still open.
    Buffered { count: usize, flush_in: Duration },
    /// A hard cap closed the buffer; dispatch this prompt now.
    Flushed(FlushedPrompt),
}

pub struct MessageBuffer {
    kv: Arc<dyn KeyValueStore>,
    cfg: BufferConfig,
    // Per-key critical sections: a timer-driven flush and an app-path
    // fragment for the same conversation must not interleave their
    // read-modify-write cycles.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl MessageBuffer {
    pub fn new(kv: Arc<dyn KeyValueStore>, cfg: BufferConfig) -> Self {
        Self {
            kv,
            cfg,
            locks: DashMap::new(),
        }
    }

    fn storage_key(key: &ConversationKey) -> String {
        format!("{BUFFER_KEY_PREFIX}{}", key.cache_token())
    }

    fn lock_for(&self, storage_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(storage_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once no caller holds it, so the map tracks only
    /// in-flight conversations instead of every key ever seen. A concurrent
    /// `lock_for` keeps the strong count above one and the entry stays.
    fn evict_lock(&self, storage_key: &str) {
        self.locks
            .remove_if(storage_key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn load(&self, storage_key: &str) -> Result<Option<BufferState>> {
        match self.kv.get(storage_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Append a fragment, opening a buffer if none exists for the key.
    ///
    /// Returns `Flushed` when a hard cap closes the buffer in the same call;
    /// the caller dispatches the prompt inline.
    pub async fn add_fragment(
        &self,
        key: &ConversationKey,
        text: &str,
        event_id: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<BufferDecision> {
        if text.is_empty() {
            return Err(PipelineError::InvalidInput(
                "empty fragment text".to_string(),
            ));
        }

        let storage_key = Self::storage_key(key);
        let lock = self.lock_for(&storage_key);
        let result = {
            let _guard = lock.lock().await;
            self.add_fragment_locked(&storage_key, key, text, event_id, now)
                .await
        };
        drop(lock);
        self.evict_lock(&storage_key);
        result
    }

    async fn add_fragment_locked(
        &self,
        storage_key: &str,
        key: &ConversationKey,
        text: &str,
        event_id: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<BufferDecision> {
        let mut state = match self.load(storage_key).await? {
            Some(state) => state,
            None => BufferState {
                conversation: key.clone(),
                fragments: Vec::new(),
                first_arrival: now,
                flush_at: now + to_chrono(self.cfg.initial_delay),
            },
        };

        state.fragments.push(Fragment {
            text: text.to_string(),
            received_at: now,
            event_id,
        });

        // Each fragment extends the quiet period, capped at max_delay past
        // the first arrival so a steady stream cannot stall the flush forever.
        if state.fragments.len() > 1 {
            let extended = now + to_chrono(self.cfg.extend_delay);
            let cap = state.first_arrival + to_chrono(self.cfg.max_delay);
            state.flush_at = extended.min(cap);
        }

        if state.fragments.len() >= self.cfg.max_fragments
            || state.total_chars() >= self.cfg.max_chars
        {
            self.kv.delete(storage_key).await?;
            let flushed = state.into_flushed();
            tracing::info!(
                conversation = %flushed.conversation,
                fragments = flushed.fragment_count,
                chars = flushed.prompt.chars().count(),
                "hard cap reached; flushing buffer early"
            );
            return Ok(BufferDecision::Flushed(flushed));
        }

        let flush_in = (state.flush_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ttl = flush_in + BUFFER_TTL_GRACE;
        self.kv
            .set(storage_key, &serde_json::to_string(&state)?, Some(ttl))
            .await?;

        tracing::debug!(
            conversation = %key,
            count = state.fragments.len(),
            flush_in_ms = flush_in.as_millis() as u64,
            "fragment buffered"
        );
        Ok(BufferDecision::Buffered {
            count: state.fragments.len(),
            flush_in,
        })
    }

    /// Conversations whose debounce deadline has elapsed as of `now`.
    pub async fn due_conversations(&self, now: DateTime<Utc>) -> Result<Vec<ConversationKey>> {
        let mut due = Vec::new();
        for storage_key in self.kv.scan_prefix(BUFFER_KEY_PREFIX).await? {
            let Some(state) = self.load(&storage_key).await? else {
                continue;
            };
            if state.flush_at <= now {
                due.push(state.conversation);
            }
        }
        Ok(due)
    }

    /// Every conversation with an open buffer, regardless of deadline.
    pub async fn active_conversations(&self) -> Result<Vec<ConversationKey>> {
        let mut active = Vec::new();
        for storage_key in self.kv.scan_prefix(BUFFER_KEY_PREFIX).await? {
            if let Some(state) = self.load(&storage_key).await? {
                active.push(state.conversation);
            }
        }
        Ok(active)
    }

    /// Close the buffer if its deadline has elapsed. Idempotent per debounce
    /// cycle: once a cycle's fragments are consumed the key is gone, and a
    /// racing second call gets `None`. Re-checks the deadline under the
    /// per-key lock so a fragment that arrived in between cleanly restarts
    /// the window instead of being swept up early.
    pub async fn flush_due(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
    ) -> Result<Option<FlushedPrompt>> {
        let storage_key = Self::storage_key(key);
        let lock = self.lock_for(&storage_key);
        let result = {
            let _guard = lock.lock().await;
            self.take_state(&storage_key, Some(now)).await
        };
        drop(lock);
        self.evict_lock(&storage_key);
        Ok(result?.map(BufferState::into_flushed))
    }

    /// Close the buffer regardless of its deadline (shutdown drain).
    pub async fn force_flush(&self, key: &ConversationKey) -> Result<Option<FlushedPrompt>> {
        let storage_key = Self::storage_key(key);
        let lock = self.lock_for(&storage_key);
        let result = {
            let _guard = lock.lock().await;
            self.take_state(&storage_key, None).await
        };
        drop(lock);
        self.evict_lock(&storage_key);
        Ok(result?.map(BufferState::into_flushed))
    }

    /// Remove and return the stored state, or `None` when there is no buffer
    /// or its deadline has not elapsed. Caller holds the per-key lock.
    async fn take_state(
        &self,
        storage_key: &str,
        due_by: Option<DateTime<Utc>>,
    ) -> Result<Option<BufferState>> {
        let Some(state) = self.load(storage_key).await? else {
            return Ok(None);
        };
        if let Some(now) = due_by {
            if state.flush_at > now {
                return Ok(None);
            }
        }
        self.kv.delete(storage_key).await?;
        Ok(Some(state))
    }

    /// Discard a buffer without processing. Returns `true` if one existed.
    pub async fn clear(&self, key: &ConversationKey) -> Result<bool> {
        let storage_key = Self::storage_key(key);
        let lock = self.lock_for(&storage_key);
        let result = {
            let _guard = lock.lock().await;
            self.kv.delete(&storage_key).await
        };
        drop(lock);
        self.evict_lock(&storage_key);
        result
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn buffer(cfg: BufferConfig) -> MessageBuffer {
        MessageBuffer::new(Arc::new(MemoryKv::new()), cfg)
    }

    fn key() -> ConversationKey {
        ConversationKey::parse("acme", "628123@c.us").unwrap()
    }

    fn at(offset_ms: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::milliseconds(offset_ms)
    }

    #[tokio::test]
    async fn fragments_flush_as_ordered_newline_joined_prompt() {
        let buf = buffer(BufferConfig::default());
        let key = key();

        buf.add_fragment(&key, "Hi", Some(MessageId::new("m1")), at(0))
            .await
            .unwrap();
        buf.add_fragment(&key, "I want", Some(MessageId::new("m2")), at(500))
            .await
            .unwrap();
        buf.add_fragment(&key, "2 burgers", Some(MessageId::new("m3")), at(1000))
            .await
            .unwrap();

        // Deadline is 2s after the last fragment; nothing due before that.
        assert!(buf.flush_due(&key, at(2500)).await.unwrap().is_none());

        let flushed = buf.flush_due(&key, at(3000)).await.unwrap().unwrap();
        assert_eq!(flushed.prompt, "Hi\nI want\n2 burgers");
        assert_eq!(flushed.fragment_count, 3);
        assert_eq!(
            flushed.event_ids,
            vec![
                MessageId::new("m1"),
                MessageId::new("m2"),
                MessageId::new("m3")
            ]
        );
    }

    #[tokio::test]
    async fn flush_is_idempotent_per_cycle() {
        let buf = buffer(BufferConfig::default());
        let key = key();
        buf.add_fragment(&key, "hello", None, at(0)).await.unwrap();

        assert!(buf.flush_due(&key, at(5000)).await.unwrap().is_some());
        assert!(buf.flush_due(&key, at(5000)).await.unwrap().is_none());

        // A later fragment starts a fresh cycle with a fresh deadline.
        let decision = buf.add_fragment(&key, "again", None, at(6000)).await.unwrap();
        match decision {
            BufferDecision::Buffered { count, .. } => assert_eq!(count, 1),
            other => panic!("expected Buffered, got {other:?}"),
        }
        assert!(buf.flush_due(&key, at(6100)).await.unwrap().is_none());
        let flushed = buf.flush_due(&key, at(8000)).await.unwrap().unwrap();
        assert_eq!(flushed.prompt, "again");
    }

    #[tokio::test]
    async fn deadline_extension_caps_at_max_delay() {
        let cfg = BufferConfig {
            initial_delay: Duration::from_secs(2),
            extend_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            ..BufferConfig::default()
        };
        let buf = buffer(cfg);
        let key = key();

        // One fragment every 1.5s keeps extending the window until the cap.
        let mut t = 0;
        for i in 0..8 {
            buf.add_fragment(&key, &format!("line {i}"), None, at(t))
                .await
                .unwrap();
            t += 1500;
        }

        // Cap is first_arrival + 10s, even though the last extension would
        // have pushed past it.
        assert!(buf.flush_due(&key, at(9_999)).await.unwrap().is_none());
        let flushed = buf.flush_due(&key, at(10_000)).await.unwrap().unwrap();
        assert_eq!(flushed.fragment_count, 8);
    }

    #[tokio::test]
    async fn fragment_count_cap_forces_immediate_flush() {
        let cfg = BufferConfig {
            max_fragments: 3,
            ..BufferConfig::default()
        };
        let buf = buffer(cfg);
        let key = key();

        buf.add_fragment(&key, "a", None, at(0)).await.unwrap();
        buf.add_fragment(&key, "b", None, at(100)).await.unwrap();
        let decision = buf.add_fragment(&key, "c", None, at(200)).await.unwrap();

        let BufferDecision::Flushed(flushed) = decision else {
            panic!("expected hard-cap flush");
        };
        assert_eq!(flushed.prompt, "a\nb\nc");

        // Remaining traffic starts a new buffer.
        let decision = buf.add_fragment(&key, "d", None, at(300)).await.unwrap();
        assert!(matches!(
            decision,
            BufferDecision::Buffered { count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn character_cap_forces_immediate_flush() {
        let cfg = BufferConfig {
            max_chars: 10,
            ..BufferConfig::default()
        };
        let buf = buffer(cfg);
        let key = key();

        buf.add_fragment(&key, "12345", None, at(0)).await.unwrap();
        let decision = buf
            .add_fragment(&key, "678901", None, at(100))
            .await
            .unwrap();
        assert!(matches!(decision, BufferDecision::Flushed(_)));
    }

    #[tokio::test]
    async fn due_conversations_reports_only_elapsed_deadlines() {
        let buf = buffer(BufferConfig::default());
        let key_a = ConversationKey::parse("acme", "111@c.us").unwrap();
        let key_b = ConversationKey::parse("acme", "222@c.us").unwrap();

        buf.add_fragment(&key_a, "early", None, at(0)).await.unwrap();
        buf.add_fragment(&key_b, "late", None, at(1500)).await.unwrap();

        let due = buf.due_conversations(at(2500)).await.unwrap();
        assert_eq!(due, vec![key_a.clone()]);

        let mut due = buf.due_conversations(at(4000)).await.unwrap();
        due.sort_by(|a, b| a.chat.as_str().cmp(b.chat.as_str()));
        assert_eq!(due, vec![key_a, key_b]);
    }

    #[tokio::test]
    async fn lock_entries_are_dropped_once_no_caller_holds_them() {
        let buf = buffer(BufferConfig::default());
        for i in 0..5 {
            let key = ConversationKey::parse("acme", &format!("{i}@c.us")).unwrap();
            buf.add_fragment(&key, "hi", None, at(0)).await.unwrap();
            assert!(buf.flush_due(&key, at(5000)).await.unwrap().is_some());
            buf.clear(&key).await.unwrap();
        }
        // No in-flight callers remain, so no per-conversation entries should
        // either; otherwise the map grows with every chat ever seen.
        assert!(buf.locks.is_empty());
    }

    #[tokio::test]
    async fn empty_fragment_text_is_rejected() {
        let buf = buffer(BufferConfig::default());
        let err = buf.add_fragment(&key(), "", None, at(0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
