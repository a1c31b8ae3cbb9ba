//! # strata-jobs
//!
//! The asynchronous reduction pipeline: a batch processor over the
//! persisted job queue, the import and recompute step handlers, the
//! debounced recompute dispatcher and an optional polling worker.
//!
//! This crate provides:
//! - [`QueueProcessor`]: sweeps stale locks, claims pending jobs and
//!   drives each one step by step
//! - [`ImportHandler`]: reduces a raw capture into conversations,
//!   messages, chunks and embeddings
//! - [`RecomputeHandler`] and [`RecomputeDispatcher`]: rebuild thinking
//!   windows and tension/priority signals per user
//! - [`PollingWorker`]: an interval loop for deployments without an
//!   external trigger
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_jobs::{ImportHandler, QueueProcessor};
//!
//! let processor = QueueProcessor::new(jobs.clone())
//!     .with_handler(import_handler)
//!     .with_handler(recompute_handler);
//!
//! let outcome = processor.process_queue(None).await?;
//! println!("processed {} jobs", outcome.processed);
//! ```

pub mod handler;
pub mod import;
pub mod processor;
pub mod recompute;
pub mod worker;

pub use handler::{NoOpHandler, StepHandler, StepOutcome};
pub use import::{ImportConfig, ImportHandler};
pub use processor::{ProcessorConfig, QueueProcessor};
pub use recompute::{RecomputeDispatcher, RecomputeHandler};
pub use worker::{PollingWorker, WorkerConfig, WorkerHandle};

// Re-export core so consumers need only one import path.
pub use strata_core::*;
