//! Job Dispatcher: turns a flushed buffer into a queued unit of work.
//!
//! Persist-then-publish: the job row is written first, so a persistence
//! failure publishes nothing; a publish failure after the retry budget
//! fails the job (QUEUED -> FAILED) so no orphaned QUEUED row survives with
//! no corresponding queue message.

use crate::buffer::FlushedPrompt;
use crate::conversation::ConversationCache;
use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::queue::{ProcessingTask, TaskPublisher};
use crate::retry::with_backoff;
use crate::tracker::JobTracker;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub struct JobDispatcher {
    tracker: Arc<JobTracker>,
    queue: Arc<dyn TaskPublisher>,
    conversations: Arc<ConversationCache>,
    publish_attempts: u32,
}

impl JobDispatcher {
    pub fn new(
        tracker: Arc<JobTracker>,
        queue: Arc<dyn TaskPublisher>,
        conversations: Arc<ConversationCache>,
        publish_attempts: u32,
    ) -> Self {
        Self {
            tracker,
            queue,
            conversations,
            publish_attempts,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation = %flushed.conversation))]
    pub async fn dispatch(&self, flushed: FlushedPrompt) -> Result<Uuid> {
        let now = Utc::now();
        let key = flushed.conversation.clone();
        let job = Job::new(key.clone(), flushed.prompt, now);
        let job_id = job.id;

        self.tracker.create_queued(&job).await?;

        let task = ProcessingTask {
            job_id,
            prompt: job.prompt.clone(),
            conversation: key.clone(),
            enqueued_at: now,
        };
        let publish = with_backoff("publish_task", self.publish_attempts, || {
            self.queue.publish(task.clone())
        })
        .await;

        if let Err(e) = publish {
            // The queued row would otherwise sit forever with no message
            // behind it; fail it so the timeout sweep and the user are not
            // left waiting.
            if let Err(fail_err) = self
                .tracker
                .transition(
                    job_id,
                    JobStatus::Failed,
                    None,
                    Some(format!("queue publish failed: {e}")),
                )
                .await
            {
                tracing::error!(%fail_err, %job_id, "could not fail job after publish failure");
            }
            return Err(e);
        }

        // Coordination-state bookkeeping is best-effort: the job is already
        // persisted and published.
        if let Err(e) = self.conversations.note_flush(&key, now).await {
            tracing::warn!(%e, conversation = %key, "conversation flush bookkeeping failed");
        }
        if let Err(e) = self.conversations.set_open_job(&key, job_id).await {
            tracing::warn!(%e, conversation = %key, "conversation open-job bookkeeping failed");
        }

        tracing::info!(
            %job_id,
            fragments = flushed.fragment_count,
            event_ids = flushed.event_ids.len(),
            "job dispatched"
        );
        Ok(job_id)
    }
}
