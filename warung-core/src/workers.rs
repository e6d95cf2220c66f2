//! Background loops: the debounce flush ticker and the job-timeout sweep.

use crate::buffer::MessageBuffer;
use crate::conversation::ConversationCache;
use crate::dispatch::JobDispatcher;
use crate::error::Result;
use crate::tracker::JobTracker;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Scans buffered conversations whose debounce deadline has elapsed and
/// flushes them through the same guarded path as an app-driven flush. This
/// covers the user who stops typing: no closing webhook event ever arrives,
/// so only the ticker can release that buffer.
pub struct FlushWorker {
    buffer: Arc<MessageBuffer>,
    dispatcher: Arc<JobDispatcher>,
    tick: Duration,
    shutdown: CancellationToken,
}

impl FlushWorker {
    pub fn new(
        buffer: Arc<MessageBuffer>,
        dispatcher: Arc<JobDispatcher>,
        tick: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            dispatcher,
            tick,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run(&self) {
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "flush worker started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.drain().await;
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick_once().await {
                        tracing::error!(%e, "flush tick failed");
                    }
                }
            }
        }
        tracing::info!("flush worker stopped");
    }

    async fn tick_once(&self) -> Result<()> {
        let now = Utc::now();
        for key in self.buffer.due_conversations(now).await? {
            // flush_due re-checks the deadline under the per-key lock, so a
            // fragment that landed since the scan cleanly restarts the
            // window instead of being flushed early.
            match self.buffer.flush_due(&key, now).await {
                Ok(Some(flushed)) => {
                    if let Err(e) = self.dispatcher.dispatch(flushed).await {
                        tracing::error!(%e, conversation = %key, "dispatch of timed flush failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(%e, conversation = %key, "timed flush failed");
                }
            }
        }
        Ok(())
    }

    /// Flush whatever is still buffered before shutting down.
    async fn drain(&self) {
        let active = match self.buffer.active_conversations().await {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(%e, "could not enumerate buffers during drain");
                return;
            }
        };
        if active.is_empty() {
            return;
        }
        tracing::info!(buffers = active.len(), "draining remaining buffers");
        for key in active {
            match self.buffer.force_flush(&key).await {
                Ok(Some(flushed)) => {
                    if let Err(e) = self.dispatcher.dispatch(flushed).await {
                        tracing::error!(%e, conversation = %key, "dispatch during drain failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(%e, conversation = %key, "drain flush failed");
                }
            }
        }
    }
}

/// Fails jobs that never reached a terminal state within the configured
/// maximum lifetime, so conversation slots are not held forever and the
/// customer hears about it.
pub struct TimeoutSweeper {
    tracker: Arc<JobTracker>,
    conversations: Arc<ConversationCache>,
    job_timeout: Duration,
    tick: Duration,
    shutdown: CancellationToken,
}

impl TimeoutSweeper {
    pub fn new(
        tracker: Arc<JobTracker>,
        conversations: Arc<ConversationCache>,
        job_timeout: Duration,
        tick: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            conversations,
            job_timeout,
            tick,
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run(&self) {
        tracing::info!(
            job_timeout_s = self.job_timeout.as_secs(),
            tick_ms = self.tick.as_millis() as u64,
            "timeout sweeper started"
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(%e, "timeout sweep failed");
                    }
                }
            }
        }
        tracing::info!("timeout sweeper stopped");
    }

    async fn sweep_once(&self) -> Result<()> {
        let swept = self.tracker.sweep_timeouts(self.job_timeout).await?;
        for job in swept {
            if let Err(e) = self.conversations.clear_job(&job.conversation, job.id).await {
                tracing::warn!(%e, job_id = %job.id, "could not clear timed-out job slot");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::job::JobStatus;
    use crate::kv::MemoryKv;
    use crate::queue::LocalTaskQueue;
    use crate::store::SqliteJobStore;
    use warung_channels::ConversationKey;

    struct Fixture {
        buffer: Arc<MessageBuffer>,
        dispatcher: Arc<JobDispatcher>,
        tracker: Arc<JobTracker>,
        conversations: Arc<ConversationCache>,
        task_rx: tokio::sync::mpsc::Receiver<crate::queue::ProcessingTask>,
        notify_rx: tokio::sync::mpsc::Receiver<crate::queue::JobNotification>,
    }

    async fn fixture(buffer_cfg: BufferConfig) -> Fixture {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let buffer = Arc::new(MessageBuffer::new(kv.clone(), buffer_cfg));
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        let (tracker, notify_rx) = JobTracker::new(store, 16);
        let (queue, task_rx) = LocalTaskQueue::new(16);
        let conversations = Arc::new(ConversationCache::new(kv, Duration::from_secs(60)));
        let dispatcher = Arc::new(JobDispatcher::new(
            tracker.clone(),
            Arc::new(queue),
            conversations.clone(),
            2,
        ));
        Fixture {
            buffer,
            dispatcher,
            tracker,
            conversations,
            task_rx,
            notify_rx,
        }
    }

    #[tokio::test]
    async fn elapsed_buffers_are_flushed_and_dispatched_exactly_once() {
        let mut fx = fixture(BufferConfig {
            initial_delay: Duration::from_millis(50),
            extend_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            ..BufferConfig::default()
        })
        .await;
        let key = ConversationKey::parse("acme", "628123@c.us").unwrap();

        fx.buffer
            .add_fragment(&key, "Hi", None, Utc::now())
            .await
            .unwrap();
        fx.buffer
            .add_fragment(&key, "I want", None, Utc::now())
            .await
            .unwrap();
        fx.buffer
            .add_fragment(&key, "2 burgers", None, Utc::now())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = Arc::new(FlushWorker::new(
            fx.buffer.clone(),
            fx.dispatcher.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        let handle = worker.start();

        let task = tokio::time::timeout(Duration::from_secs(2), fx.task_rx.recv())
            .await
            .expect("flush worker should dispatch within the window")
            .unwrap();
        assert_eq!(task.prompt, "Hi\nI want\n2 burgers");

        // One cycle, one job; nothing further arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fx.task_rx.try_recv().is_err());

        let job = fx.tracker.status(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_open_buffers() {
        let mut fx = fixture(BufferConfig {
            initial_delay: Duration::from_secs(60),
            extend_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            ..BufferConfig::default()
        })
        .await;
        let key = ConversationKey::parse("acme", "628123@c.us").unwrap();
        fx.buffer
            .add_fragment(&key, "still typing", None, Utc::now())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = Arc::new(FlushWorker::new(
            fx.buffer.clone(),
            fx.dispatcher.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        handle.await.unwrap();

        let task = fx.task_rx.try_recv().unwrap();
        assert_eq!(task.prompt, "still typing");
    }

    #[tokio::test]
    async fn sweeper_times_out_stuck_jobs_and_clears_the_slot() {
        let mut fx = fixture(BufferConfig::default()).await;
        let key = ConversationKey::parse("acme", "628123@c.us").unwrap();

        let flushed = crate::buffer::FlushedPrompt {
            conversation: key.clone(),
            prompt: "hello?".to_string(),
            event_ids: vec![],
            fragment_count: 1,
            first_arrival: Utc::now(),
        };
        let job_id = fx.dispatcher.dispatch(flushed).await.unwrap();
        assert_eq!(
            fx.conversations
                .get(&key)
                .await
                .unwrap()
                .unwrap()
                .open_job_id,
            Some(job_id)
        );

        let shutdown = CancellationToken::new();
        let sweeper = Arc::new(TimeoutSweeper::new(
            fx.tracker.clone(),
            fx.conversations.clone(),
            Duration::ZERO, // every non-terminal job is immediately stuck
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        let handle = sweeper.start();

        let note = tokio::time::timeout(Duration::from_secs(2), fx.notify_rx.recv())
            .await
            .expect("sweep should notify")
            .unwrap();
        assert_eq!(note.job_id, job_id);
        assert_eq!(note.status, JobStatus::Failed);
        assert_eq!(note.error.as_deref(), Some("job timed out"));

        shutdown.cancel();
        handle.await.unwrap();

        let job = fx.tracker.status(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let entry = fx.conversations.get(&key).await.unwrap().unwrap();
        assert!(entry.open_job_id.is_none());
    }
}
