//! Outbound publisher: delivers terminal-job outcomes back to the chat.
//!
//! Consumes `JobNotification`s, suppresses duplicate deliveries with a
//! per-job-id dedup key, and sends the reply (or a failure notice) through
//! the channel sender. Delivery is at-least-once upstream; the dedup guard
//! makes it effectively once toward the customer.

use crate::conversation::ConversationCache;
use crate::dedup::{DedupGuard, Fingerprint};
use crate::error::{PipelineError, Result};
use crate::job::JobStatus;
use crate::queue::JobNotification;
use crate::retry::with_backoff;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warung_channels::{ChannelSender, OutboundMessage};

pub const SENT_KEY_PREFIX: &str = "sent:";

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Tell the customer when their request failed, instead of going silent.
    pub notify_on_failure: bool,
    pub failure_text: String,
    pub send_attempts: u32,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            notify_on_failure: true,
            failure_text: "Maaf, terjadi kendala saat memproses pesan Anda. Silakan coba lagi."
                .to_string(),
            send_attempts: 3,
        }
    }
}

pub struct OutboundPublisher {
    sender: Arc<dyn ChannelSender>,
    guard: DedupGuard,
    conversations: Arc<ConversationCache>,
    cfg: OutboundConfig,
    shutdown: CancellationToken,
}

impl OutboundPublisher {
    pub fn new(
        sender: Arc<dyn ChannelSender>,
        guard: DedupGuard,
        conversations: Arc<ConversationCache>,
        cfg: OutboundConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sender,
            guard,
            conversations,
            cfg,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>, rx: mpsc::Receiver<JobNotification>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx).await })
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel = self.sender.channel_id()))]
    async fn run(&self, mut rx: mpsc::Receiver<JobNotification>) {
        tracing::info!("outbound publisher started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                note = rx.recv() => {
                    let Some(note) = note else { break };
                    if let Err(e) = self.deliver(note).await {
                        tracing::error!(%e, "outbound delivery failed");
                    }
                }
            }
        }
        // Upstream already persisted every terminal state; drain what is
        // still queued so a clean shutdown does not eat replies.
        while let Ok(note) = rx.try_recv() {
            if let Err(e) = self.deliver(note).await {
                tracing::error!(%e, "outbound delivery failed during drain");
            }
        }
        tracing::info!("outbound publisher stopped");
    }

    /// Deliver one terminal notification. Replays of an already-delivered
    /// job id are dropped silently.
    pub async fn deliver(&self, note: JobNotification) -> Result<()> {
        // Reject bad input before burning the job's delivery fingerprint,
        // or the eventual terminal notification would look like a replay.
        if !note.status.is_terminal() {
            return Err(PipelineError::InvariantViolation(format!(
                "non-terminal notification for job {}: {}",
                note.job_id, note.status
            )));
        }

        let fingerprint = Fingerprint::for_job_delivery(note.job_id);
        if !self.guard.admit(&fingerprint).await? {
            tracing::info!(job_id = %note.job_id, "reply already delivered; replay dropped");
            return Ok(());
        }

        let text = match note.status {
            JobStatus::Completed => match note.result.clone() {
                Some(text) if !text.trim().is_empty() => Some(text),
                _ => {
                    tracing::warn!(job_id = %note.job_id, "completed job carried no reply text");
                    None
                }
            },
            JobStatus::Failed => {
                tracing::warn!(
                    job_id = %note.job_id,
                    error = note.error.as_deref().unwrap_or("unknown"),
                    "job failed"
                );
                self.cfg
                    .notify_on_failure
                    .then(|| self.cfg.failure_text.clone())
            }
            // Unreachable after the terminal check above.
            JobStatus::Queued | JobStatus::Processing => None,
        };

        if let Some(text) = text {
            let message = OutboundMessage {
                conversation: note.conversation.clone(),
                text,
                reply_to: None,
                job_id: Some(note.job_id),
            };
            let sent = with_backoff("outbound_send", self.cfg.send_attempts, || {
                let message = message.clone();
                async move {
                    self.sender
                        .send(&message)
                        .await
                        .map_err(|e| PipelineError::Channel(e.to_string()))
                }
            })
            .await;
            if let Err(e) = sent {
                // Nothing reached the customer; free the delivery key so a
                // replayed notification can still send the reply.
                if let Err(release_err) = self.guard.release(&fingerprint).await {
                    tracing::error!(
                        %release_err,
                        job_id = %note.job_id,
                        "could not release delivery fingerprint of failed send"
                    );
                }
                return Err(e);
            }
            tracing::info!(
                job_id = %note.job_id,
                conversation = %note.conversation,
                status = %note.status,
                "reply delivered"
            );
        }

        // The conversation slot clears even when nothing was sent, so the
        // next turn starts unblocked.
        if let Err(e) = self
            .conversations
            .clear_job(&note.conversation, note.job_id)
            .await
        {
            tracing::warn!(%e, job_id = %note.job_id, "could not clear delivered job slot");
        }
        Ok(())
    }
}
