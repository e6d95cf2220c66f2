//! Processing-queue seam and wire payloads.
//!
//! The broker itself is external; the pipeline only needs a publisher for
//! task messages. Task payloads and completion notifications are distinct,
//! explicitly tagged message kinds — never the same shape distinguished by
//! which fields happen to be present.

use crate::error::{PipelineError, Result};
use crate::job::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;
use warung_channels::ConversationKey;

/// Queue message handed to the AI-processing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "processing_task")]
pub struct ProcessingTask {
    pub job_id: Uuid,
    pub prompt: String,
    pub conversation: ConversationKey,
    pub enqueued_at: DateTime<Utc>,
}

/// Completion-side message observed by the outbound publisher once a job
/// reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "job_notification")]
pub struct JobNotification {
    pub job_id: Uuid,
    pub conversation: ConversationKey,
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish(&self, task: ProcessingTask) -> Result<()>;
}

/// In-process queue over a bounded tokio channel, standing in for the broker.
/// `new` hands back the single consumer side for the AI worker.
pub struct LocalTaskQueue {
    tx: mpsc::Sender<ProcessingTask>,
}

impl LocalTaskQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProcessingTask>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskPublisher for LocalTaskQueue {
    async fn publish(&self, task: ProcessingTask) -> Result<()> {
        let job_id = task.job_id;
        self.tx
            .send(task)
            .await
            .map_err(|_| PipelineError::Transient("task queue closed".to_string()))?;
        tracing::debug!(%job_id, "processing task published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_tasks_reach_the_consumer_in_order() {
        let (queue, mut rx) = LocalTaskQueue::new(8);
        let conversation = ConversationKey::parse("acme", "628123@c.us").unwrap();
        for prompt in ["first", "second"] {
            queue
                .publish(ProcessingTask {
                    job_id: Uuid::new_v4(),
                    prompt: prompt.to_string(),
                    conversation: conversation.clone(),
                    enqueued_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().prompt, "first");
        assert_eq!(rx.recv().await.unwrap().prompt, "second");
    }

    #[tokio::test]
    async fn publish_into_closed_queue_is_transient() {
        let (queue, rx) = LocalTaskQueue::new(1);
        drop(rx);
        let err = queue
            .publish(ProcessingTask {
                job_id: Uuid::new_v4(),
                prompt: "x".to_string(),
                conversation: ConversationKey::parse("acme", "1@c.us").unwrap(),
                enqueued_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn wire_payloads_carry_distinct_kind_tags() {
        let task = ProcessingTask {
            job_id: Uuid::new_v4(),
            prompt: "hi".to_string(),
            conversation: ConversationKey::parse("acme", "1@c.us").unwrap(),
            enqueued_at: Utc::now(),
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], "processing_task");

        let note = JobNotification {
            job_id: task.job_id,
            conversation: task.conversation.clone(),
            status: JobStatus::Completed,
            result: Some("done".to_string()),
            error: None,
        };
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(value["kind"], "job_notification");
        assert_eq!(value["status"], "COMPLETED");
    }
}
