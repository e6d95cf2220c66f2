//! Inbound-message orchestration for Warung: dedup, debounce buffering,
//! conversation coordination, job dispatch, and outbound delivery.
//!
//! The pipeline is a chain of small services sharing a [`kv::KeyValueStore`]
//! for coordination state and a [`store::SqliteJobStore`] for the durable
//! job ledger:
//!
//! webhook -> [`ingest::MessageIngest`] -> [`buffer::MessageBuffer`]
//!         -> [`dispatch::JobDispatcher`] -> queue -> AI worker
//!         -> [`tracker::JobTracker`] -> [`outbound::OutboundPublisher`]

pub mod buffer;
pub mod conversation;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod job;
pub mod kv;
pub mod outbound;
pub mod queue;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod workers;

pub use buffer::{BufferConfig, BufferDecision, FlushedPrompt, MessageBuffer};
pub use conversation::{ConversationCache, ConversationEntry};
pub use dedup::{DedupGuard, Fingerprint};
pub use dispatch::JobDispatcher;
pub use error::{PipelineError, Result};
pub use ingest::{IngestOutcome, MessageIngest};
pub use job::{Job, JobStatus};
pub use kv::{KeyValueStore, MemoryKv};
pub use outbound::{OutboundConfig, OutboundPublisher};
pub use queue::{JobNotification, LocalTaskQueue, ProcessingTask, TaskPublisher};
pub use store::SqliteJobStore;
pub use tracker::JobTracker;
pub use workers::{FlushWorker, TimeoutSweeper};
