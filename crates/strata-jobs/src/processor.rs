//! Batch runner over the persisted job queue.
//!
//! One `process_queue` call sweeps expired locks, claims a batch of
//! pending jobs and drives each claimed job step by step until its
//! handler reports completion or an error. Multiple processors may run
//! against the same queue; the conditional claim keeps every job on
//! exactly one of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use strata_core::{defaults, Error, Job, JobRepository, JobType, ProcessOutcome, Result};

use crate::handler::{StepHandler, StepOutcome};

/// Drive iterations allowed per claimed job. The longest step chain has
/// seven entries; exceeding this means a handler never reports
/// `Finished`.
const MAX_STEPS_PER_CLAIM: usize = 16;

/// Tuning for one processor instance.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Jobs claimed per `process_queue` invocation when the caller does
    /// not pass a limit.
    pub batch_limit: i64,
    /// Lock lease; jobs locked longer than this are swept to `error`
    /// before each batch.
    pub lock_lease: chrono::Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_limit: defaults::PROCESS_BATCH_LIMIT,
            lock_lease: chrono::Duration::seconds(defaults::LOCK_LEASE_SECS),
        }
    }
}

impl ProcessorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STRATA_PROCESS_BATCH_LIMIT` | `10` | Jobs claimed per batch |
    /// | `STRATA_LOCK_LEASE_SECS` | `600` | Lock lease before stale reclaim |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let batch_limit = std::env::var("STRATA_PROCESS_BATCH_LIMIT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults.batch_limit);
        let lock_lease = std::env::var("STRATA_LOCK_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(chrono::Duration::seconds)
            .unwrap_or(defaults.lock_lease);
        Self {
            batch_limit,
            lock_lease,
        }
    }

    pub fn with_batch_limit(mut self, limit: i64) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_lock_lease_secs(mut self, secs: i64) -> Self {
        self.lock_lease = chrono::Duration::seconds(secs);
        self
    }
}

/// Claims pending jobs and drives each through its registered handler.
pub struct QueueProcessor {
    jobs: Arc<dyn JobRepository>,
    handlers: HashMap<JobType, Arc<dyn StepHandler>>,
    config: ProcessorConfig,
}

impl QueueProcessor {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            handlers: HashMap::new(),
            config: ProcessorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the handler for its job type, replacing any previous
    /// registration.
    pub fn with_handler<H: StepHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.insert(handler.job_type(), Arc::new(handler));
        self
    }

    /// Process one batch of claimable jobs.
    ///
    /// Jobs whose claim is lost to a concurrent processor are skipped
    /// and not counted. The returned outcome partitions every claimed
    /// job into succeeded or failed.
    #[instrument(
        skip(self, limit),
        fields(subsystem = "jobs", component = "processor", op = "process_queue")
    )]
    pub async fn process_queue(&self, limit: Option<i64>) -> Result<ProcessOutcome> {
        let start = Instant::now();
        let limit = limit.unwrap_or(self.config.batch_limit);

        // Sweep expired locks first so jobs orphaned by a crashed owner
        // become retryable instead of blocking the queue.
        match self.jobs.reclaim_stale(self.config.lock_lease).await {
            Ok(swept) if !swept.is_empty() => {
                warn!(count = swept.len(), "Reclaimed stale job locks");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stale lock sweep failed"),
        }

        let claimable = self.jobs.list_claimable(None, limit).await?;

        let mut outcome = ProcessOutcome::default();
        for job in claimable {
            match self.jobs.claim(job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    // A concurrent processor owns it.
                    debug!(job_id = %job.id, "Lost claim race, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Claim failed, skipping");
                    continue;
                }
            }

            let job_id = job.id;
            outcome.processed += 1;
            outcome.job_ids.push(job_id);

            if self.drive(job).await {
                outcome.succeeded.push(job_id);
            } else {
                outcome.failed.push(job_id);
            }
        }

        info!(
            processed = outcome.processed,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Queue batch complete"
        );

        Ok(outcome)
    }

    /// Drive one claimed job until its handler finishes or fails.
    /// Returns whether the job completed.
    async fn drive(&self, mut job: Job) -> bool {
        let job_id = job.id;
        let start = Instant::now();
        info!(job_id = %job_id, job_type = job.job_type.as_str(), job_step = %job.step, "Processing job");

        let Some(handler) = self.handlers.get(&job.job_type) else {
            let message = format!(
                "no handler registered for job type {}",
                job.job_type.as_str()
            );
            error!(job_id = %job_id, "{}", message);
            self.record_failure(job_id, &message).await;
            return false;
        };

        for _ in 0..MAX_STEPS_PER_CLAIM {
            match handler.run_step(&job).await {
                Ok(StepOutcome::Advanced { step, progress }) => {
                    if let Err(e) = self.jobs.record_progress(job_id, step, &progress).await {
                        self.abandon(job_id, step, e).await;
                        return false;
                    }
                    job.step = step.to_string();
                    job.progress = Some(progress);
                }
                Ok(StepOutcome::Finished { step, progress }) => {
                    if let Err(e) = self.jobs.record_progress(job_id, step, &progress).await {
                        self.abandon(job_id, step, e).await;
                        return false;
                    }
                    if let Err(e) = self.jobs.complete(job_id).await {
                        self.abandon(job_id, step, e).await;
                        return false;
                    }
                    info!(
                        job_id = %job_id,
                        job_type = job.job_type.as_str(),
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job completed"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(job_id = %job_id, job_step = %job.step, error = %e, "Job step failed");
                    self.record_failure(job_id, &e.to_string()).await;
                    return false;
                }
            }
        }

        let message = format!(
            "handler did not finish within {} steps",
            MAX_STEPS_PER_CLAIM
        );
        error!(job_id = %job_id, "{}", message);
        self.record_failure(job_id, &message).await;
        false
    }

    /// A bookkeeping write failed mid-drive. After a stale-lock error
    /// the sweep owns the job's fate; anything else marks the job
    /// failed.
    async fn abandon(&self, job_id: Uuid, step: &str, e: Error) {
        match e {
            Error::StaleLock(_) => {
                warn!(job_id = %job_id, job_step = %step, error = %e, "Lost job lease mid-run");
            }
            e => {
                error!(job_id = %job_id, job_step = %step, error = %e, "Job bookkeeping failed");
                self.record_failure(job_id, &e.to_string()).await;
            }
        }
    }

    async fn record_failure(&self, job_id: Uuid, message: &str) {
        if let Err(e) = self.jobs.fail(job_id, message).await {
            error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
        }
    }
}
