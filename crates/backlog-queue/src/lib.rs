//! # Backlog Queue
//!
//! Queued job processing with lease-based claiming.
//!
//! Features:
//! - `JobRecord` data model and `JobState` machine
//! - Pluggable `QueueBackend` (in-memory here, SQLite in `backlog-persist`)
//! - `Processor` with per-invocation time budget and retry policy
//! - `WorkerPool` for long-running workers
//! - Injectable `Clock` for deterministic tests

pub mod backend;
pub mod clock;
pub mod config;
pub mod job;
pub mod job_type;
pub mod memory;
pub mod processor;
pub mod queue;
pub mod worker;

pub use backend::{CleanupReport, QueueBackend, QueueError};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ConfigError, QueueConfig, ThresholdPolicy, ThresholdStates, ThresholdType};
pub use job::{BackoffStrategy, JobId, JobRecord, JobResult, JobState};
pub use job_type::{JobType, JobTypeRegistry};
pub use memory::MemoryBackend;
pub use processor::Processor;
pub use queue::Queue;
pub use worker::{WorkerConfig, WorkerPool};
