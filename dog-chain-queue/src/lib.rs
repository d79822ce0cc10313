//! # dog-chain-queue: Reliable Submission Queue for Chain Backends
//!
//! **Idempotent, attempt-bounded job processing with dead-letter escalation**
//!
//! dog-chain-queue sits between request handlers and an unreliable backend
//! (a blockchain RPC node, a signer, a relayer) and makes sure each logical
//! operation is submitted once, retried with exponential backoff, and parked
//! for an operator when it keeps failing.
//!
//! ## 🎯 Guarantees
//!
//! - **Idempotent Enqueue**: One live job per idempotency key, derived from the payload when omitted
//! - **Bounded Attempts**: `attempts` never exceeds `max_attempts`; exhausted jobs move to `DEAD`
//! - **Single Flight**: Jobs are claimed atomically, concurrent passes never run the same job
//! - **Isolated Observers**: Failing or panicking event handlers never disturb the queue
//! - **Deterministic Time**: Every scheduling decision reads an injectable [`Clock`]
//!
//! ## 🚀 Quick Start
//!
//! ```rust,no_run
//! use dog_chain_queue::prelude::*;
//! use serde_json::json;
//!
//! async fn submit(job: JobRecord) -> ProcessResult {
//!     match job.job_type.as_str() {
//!         "MINT_TOKEN" => ProcessResult::success("0xabc"),
//!         other => ProcessResult::permanent(format!("unknown job type {}", other)),
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let engine = QueueEngine::new(QueueConfig::from_env()?)?;
//!
//! engine.on(JobEventKind::Dead, |event| {
//!     tracing::error!(job_id = %event.job.id, "Operator attention required");
//!     Ok(())
//! });
//!
//! let id = engine.enqueue("MINT_TOKEN", json!({ "to": "0x01", "amount": 5 }), None)?;
//! engine.process_jobs(&submit).await;
//!
//! assert_eq!(engine.get_job(&id).map(|job| job.status), Some(JobStatus::Completed));
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod poller;
pub mod processor;
pub mod sink;
pub mod store;
pub mod types;

#[cfg(feature = "tracing-basic")]
pub mod telemetry;

// Core API exports
pub use engine::{default_engine, reset_default, set_default, ProcessSummary, QueueEngine};
pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use types::{JobEvent, JobEventKind, JobId, JobRecord, JobStatus, QueueStats};
pub use processor::{ProcessResult, Processor};
pub use sink::{EventSink, ListenerId};
pub use poller::{spawn_poller, PollerHandle};

// Building blocks
pub use backoff::{backoff_delay, BackoffPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use idempotency::{derive_idempotency_key, IdempotencyIndex};
pub use store::{JobStore, MemoryJobStore};

pub mod prelude {
    pub use crate::{
        spawn_poller, Clock, JobEvent, JobEventKind, JobId, JobRecord, JobStatus, ProcessResult,
        Processor, QueueConfig, QueueEngine, QueueError, QueueResult, QueueStats,
    };

    pub use async_trait::async_trait;
}
