//! Job aggregate and its lifecycle state machine.
//!
//! Transitions are monotonic and one-directional:
//!
//!   QUEUED ──► PROCESSING ──► COMPLETED
//!      │            │
//!      └────────────┴───────► FAILED
//!
//! COMPLETED and FAILED are terminal; any other transition attempt is an
//! invariant violation (a caller bug, never retried).

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use warung_channels::ConversationKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of asynchronous AI-processing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub conversation: ConversationKey,
    pub prompt: String,
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(conversation: ConversationKey, prompt: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation,
            prompt,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition_to(&mut self, target: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(PipelineError::InvariantViolation(format!(
                "job {}: illegal transition {} -> {}",
                self.id, self.status, target
            )));
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(JobStatus::Processing, now)
    }

    pub fn complete(&mut self, result: String, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(JobStatus::Completed, now)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(JobStatus::Failed, now)?;
        self.error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            ConversationKey::parse("acme", "628123@c.us").unwrap(),
            "Hi".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut job = job();
        let now = Utc::now();
        job.mark_processing(now).unwrap();
        job.complete("done".to_string(), now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_deref(), Some("done"));
    }

    #[test]
    fn queued_can_fail_directly() {
        let mut job = job();
        job.fail("publish exhausted".to_string(), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn terminal_states_reject_all_writes() {
        let now = Utc::now();
        let mut done = job();
        done.mark_processing(now).unwrap();
        done.complete("ok".to_string(), now).unwrap();

        assert!(done.mark_processing(now).unwrap_err().is_invariant_violation());
        assert!(
            done.fail("late".to_string(), now)
                .unwrap_err()
                .is_invariant_violation()
        );
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("ok"));
    }

    #[test]
    fn completed_requires_processing_first() {
        let mut fresh = job();
        let err = fresh.complete("too soon".to_string(), Utc::now()).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(fresh.status, JobStatus::Queued);
    }

    #[test]
    fn status_round_trips_through_store_representation() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("RETRYING").is_err());
    }
}
