//! Job State Machine service: the single write path for job state after the
//! dispatcher hands a job off.
//!
//! The AI worker (external) reports PROCESSING and terminal states through
//! `transition`; terminal transitions emit a `JobNotification` for the
//! outbound publisher. The timeout sweep fails stuck jobs the same way.

use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::queue::JobNotification;
use crate::store::SqliteJobStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct JobTracker {
    store: Arc<SqliteJobStore>,
    notify_tx: mpsc::Sender<JobNotification>,
}

impl JobTracker {
    pub fn new(
        store: Arc<SqliteJobStore>,
        notify_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<JobNotification>) {
        let (notify_tx, notify_rx) = mpsc::channel(notify_capacity);
        (Arc::new(Self { store, notify_tx }), notify_rx)
    }

    pub async fn create_queued(&self, job: &Job) -> Result<()> {
        self.store.insert(job).await?;
        tracing::info!(job_id = %job.id, conversation = %job.conversation, "job queued");
        Ok(())
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }

    /// Advance a job. Illegal transitions surface as invariant violations;
    /// terminal transitions notify the outbound publisher.
    pub async fn transition(
        &self,
        job_id: Uuid,
        target: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Job> {
        let job = self
            .store
            .transition(job_id, target, result, error, Utc::now())
            .await?;
        tracing::info!(job_id = %job.id, status = %job.status, "job transitioned");
        if job.status.is_terminal() {
            self.notify(&job).await;
        }
        Ok(job)
    }

    /// Fail every job that has outlived `max_lifetime` without reaching a
    /// terminal state, notifying downstream for each.
    pub async fn sweep_timeouts(&self, max_lifetime: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(max_lifetime)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let swept = self.store.sweep_stuck(cutoff, now).await?;
        for job in &swept {
            tracing::warn!(job_id = %job.id, conversation = %job.conversation, "job timed out");
            self.notify(job).await;
        }
        Ok(swept)
    }

    async fn notify(&self, job: &Job) {
        let notification = JobNotification {
            job_id: job.id,
            conversation: job.conversation.clone(),
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
        };
        // The job row is already persisted; a lost notification must not
        // roll the transition back, so this is log-only.
        if self.notify_tx.send(notification).await.is_err() {
            tracing::error!(job_id = %job.id, "notification channel closed; outbound delivery skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warung_channels::ConversationKey;

    async fn tracker() -> (Arc<JobTracker>, mpsc::Receiver<JobNotification>) {
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        JobTracker::new(store, 16)
    }

    fn job() -> Job {
        Job::new(
            ConversationKey::parse("acme", "628123@c.us").unwrap(),
            "Hi".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn only_terminal_transitions_notify() {
        let (tracker, mut rx) = tracker().await;
        let job = job();
        tracker.create_queued(&job).await.unwrap();

        tracker
            .transition(job.id, JobStatus::Processing, None, None)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        tracker
            .transition(job.id, JobStatus::Completed, Some("done".to_string()), None)
            .await
            .unwrap();
        let note = rx.recv().await.unwrap();
        assert_eq!(note.job_id, job.id);
        assert_eq!(note.status, JobStatus::Completed);
        assert_eq!(note.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn sweep_notifies_for_each_timed_out_job() {
        let (tracker, mut rx) = tracker().await;
        let mut stuck = job();
        stuck.created_at = Utc::now() - chrono::Duration::seconds(120);
        stuck.updated_at = stuck.created_at;
        tracker.create_queued(&stuck).await.unwrap();

        let swept = tracker
            .sweep_timeouts(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);

        let note = rx.recv().await.unwrap();
        assert_eq!(note.job_id, stuck.id);
        assert_eq!(note.status, JobStatus::Failed);
        assert_eq!(note.error.as_deref(), Some("job timed out"));
    }

    #[tokio::test]
    async fn status_reads_back_the_persisted_job() {
        let (tracker, _rx) = tracker().await;
        let job = job();
        tracker.create_queued(&job).await.unwrap();
        let fetched = tracker.status(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
        assert!(tracker.status(Uuid::new_v4()).await.unwrap().is_none());
    }
}
