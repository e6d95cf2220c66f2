//! Ingest entrypoint: the single path every inbound webhook event takes.
//!
//! Ordering is fixed: cheap drops first (own messages, empty text), then the
//! dedup guard, then the debounce buffer. A hard-capped buffer flushes
//! inline so the oversized turn dispatches on the same call that closed it.

use crate::buffer::{BufferDecision, MessageBuffer};
use crate::conversation::ConversationCache;
use crate::dedup::{DedupGuard, Fingerprint};
use crate::dispatch::JobDispatcher;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warung_channels::InboundEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already seen within the dedup window.
    Duplicate,
    /// Dropped before buffering; carries the reason for the access log.
    Ignored(&'static str),
    /// Fragment stored; the debounce timer will flush it.
    Buffered { fragments: usize, flush_in: Duration },
    /// A hard cap closed the buffer and the job went out immediately.
    Dispatched(Uuid),
}

pub struct MessageIngest {
    guard: DedupGuard,
    buffer: Arc<MessageBuffer>,
    conversations: Arc<ConversationCache>,
    dispatcher: Arc<JobDispatcher>,
}

impl MessageIngest {
    pub fn new(
        guard: DedupGuard,
        buffer: Arc<MessageBuffer>,
        conversations: Arc<ConversationCache>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Self {
        Self {
            guard,
            buffer,
            conversations,
            dispatcher,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation = %event.conversation))]
    pub async fn handle_event(&self, event: InboundEvent) -> Result<IngestOutcome> {
        if event.from_me {
            tracing::debug!("own outbound echo ignored");
            return Ok(IngestOutcome::Ignored("own message"));
        }
        let text = event.text.trim();
        if text.is_empty() {
            tracing::debug!("empty or non-text event ignored");
            return Ok(IngestOutcome::Ignored("empty text"));
        }

        let fingerprint = Fingerprint::from_event(&event);
        if !self.guard.admit(&fingerprint).await? {
            return Ok(IngestOutcome::Duplicate);
        }

        // An admitted fingerprint promises the message was processed. If the
        // stages behind it fail, free it again so the provider's redelivery
        // is a fresh attempt, not a mistaken duplicate.
        match self.buffer_event(&event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = self.guard.release(&fingerprint).await {
                    tracing::error!(
                        %release_err,
                        fingerprint = %fingerprint,
                        "could not release fingerprint of failed ingest"
                    );
                }
                Err(e)
            }
        }
    }

    async fn buffer_event(&self, event: &InboundEvent) -> Result<IngestOutcome> {
        // Coordination state is advisory; a failed write must not drop the
        // message itself.
        if let Err(e) = self
            .conversations
            .note_buffer_opened(&event.conversation, event.received_at)
            .await
        {
            tracing::warn!(%e, "buffer-open bookkeeping failed");
        }

        let decision = self
            .buffer
            .add_fragment(
                &event.conversation,
                event.text.trim(),
                event.event_id.clone(),
                event.received_at,
            )
            .await?;
        match decision {
            BufferDecision::Buffered { count, flush_in } => {
                tracing::info!(
                    fragments = count,
                    flush_in_ms = flush_in.as_millis() as u64,
                    "fragment buffered"
                );
                Ok(IngestOutcome::Buffered {
                    fragments: count,
                    flush_in,
                })
            }
            BufferDecision::Flushed(flushed) => {
                tracing::info!(fragments = flushed.fragment_count, "buffer cap reached");
                let job_id = self.dispatcher.dispatch(flushed).await?;
                Ok(IngestOutcome::Dispatched(job_id))
            }
        }
    }
}
