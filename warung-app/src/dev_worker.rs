//! Dev-mode stand-in for the external AI worker.
//!
//! Consumes the local task queue and walks each job through the real state
//! machine (PROCESSING, then COMPLETED with an echo reply), so the whole
//! pipeline runs end-to-end without an LLM behind it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warung_core::{JobStatus, JobTracker, ProcessingTask};

pub struct EchoWorker {
    tracker: Arc<JobTracker>,
    reply_prefix: String,
    latency: Duration,
    shutdown: CancellationToken,
}

impl EchoWorker {
    pub fn new(
        tracker: Arc<JobTracker>,
        reply_prefix: String,
        latency: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            reply_prefix,
            latency,
            shutdown,
        }
    }

    pub fn start(self, mut rx: mpsc::Receiver<ProcessingTask>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(latency_ms = self.latency.as_millis() as u64, "echo worker started");
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    task = rx.recv() => {
                        let Some(task) = task else { break };
                        if let Err(e) = self.process(task).await {
                            tracing::error!(%e, "echo worker task failed");
                        }
                    }
                }
            }
            tracing::info!("echo worker stopped");
        })
    }

    async fn process(&self, task: ProcessingTask) -> warung_core::Result<()> {
        self.tracker
            .transition(task.job_id, JobStatus::Processing, None, None)
            .await?;
        tokio::time::sleep(self.latency).await;
        let reply = format!("{}{}", self.reply_prefix, task.prompt);
        self.tracker
            .transition(task.job_id, JobStatus::Completed, Some(reply), None)
            .await?;
        Ok(())
    }
}

/// Queue drain for production mode, where the external worker consumes a
/// real broker and this process only logs what it handed off.
pub fn spawn_queue_logger(
    mut rx: mpsc::Receiver<ProcessingTask>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                task = rx.recv() => {
                    let Some(task) = task else { break };
                    tracing::info!(
                        job_id = %task.job_id,
                        conversation = %task.conversation,
                        "task queued for external worker"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warung_channels::ConversationKey;
    use warung_core::{Job, LocalTaskQueue, SqliteJobStore, TaskPublisher};

    #[tokio::test]
    async fn echo_worker_completes_jobs_with_the_prefixed_prompt() {
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        let (tracker, mut notify_rx) = JobTracker::new(store, 16);
        let (queue, task_rx) = LocalTaskQueue::new(16);
        let shutdown = CancellationToken::new();

        let job = Job::new(
            ConversationKey::parse("acme", "628123@c.us").unwrap(),
            "2 burgers please".to_string(),
            Utc::now(),
        );
        tracker.create_queued(&job).await.unwrap();
        queue
            .publish(ProcessingTask {
                job_id: job.id,
                prompt: job.prompt.clone(),
                conversation: job.conversation.clone(),
                enqueued_at: Utc::now(),
            })
            .await
            .unwrap();

        let worker = EchoWorker::new(
            tracker.clone(),
            "echo: ".to_string(),
            Duration::from_millis(5),
            shutdown.clone(),
        );
        let handle = worker.start(task_rx);

        let note = tokio::time::timeout(Duration::from_secs(2), notify_rx.recv())
            .await
            .expect("echo worker should complete the job")
            .unwrap();
        assert_eq!(note.job_id, job.id);
        assert_eq!(note.status, JobStatus::Completed);
        assert_eq!(note.result.as_deref(), Some("echo: 2 burgers please"));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
