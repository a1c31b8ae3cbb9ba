//! Interval polling worker for deployments without an external queue
//! trigger. Wraps a [`QueueProcessor`] in a poll/sleep loop with
//! graceful shutdown and periodic retention cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use strata_core::{defaults, Error, JobRepository, Result};

use crate::processor::QueueProcessor;

/// Retention cleanup runs every this many polls (hourly at the default
/// interval).
const CLEANUP_EVERY_TICKS: u64 = 120;

/// Configuration for the polling worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Terminal jobs older than this many days are pruned.
    pub retention_days: i32,
    /// Whether the polling loop runs at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
            retention_days: defaults::JOB_RETENTION_DAYS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STRATA_WORKER_ENABLED` | `true` | Enable/disable the polling loop |
    /// | `STRATA_WORKER_POLL_INTERVAL_MS` | `30000` | Interval between queue scans |
    /// | `STRATA_JOB_RETENTION_DAYS` | `30` | Terminal-job age before pruning |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var("STRATA_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(defaults.enabled);
        let poll_interval_ms = std::env::var("STRATA_WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.poll_interval_ms);
        let retention_days = std::env::var("STRATA_JOB_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults.retention_days);
        Self {
            poll_interval_ms,
            retention_days,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_retention_days(mut self, days: i32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Handle for stopping a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop after its current batch.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("worker already stopped".to_string()))
    }
}

/// Interval loop driving a [`QueueProcessor`].
pub struct PollingWorker {
    processor: Arc<QueueProcessor>,
    jobs: Arc<dyn JobRepository>,
    config: WorkerConfig,
}

impl PollingWorker {
    pub fn new(
        processor: Arc<QueueProcessor>,
        jobs: Arc<dyn JobRepository>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            processor,
            jobs,
            config,
        }
    }

    /// Spawn the polling loop and return a shutdown handle.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        WorkerHandle { shutdown_tx }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Polling worker disabled, not starting");
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            retention_days = self.config.retention_days,
            "Polling worker started"
        );

        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut ticks: u64 = 0;
        loop {
            match self.processor.process_queue(None).await {
                Ok(outcome) if outcome.processed > 0 => {
                    debug!(
                        processed = outcome.processed,
                        succeeded = outcome.succeeded.len(),
                        failed = outcome.failed.len(),
                        "Worker batch complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Worker batch failed"),
            }

            ticks += 1;
            if ticks % CLEANUP_EVERY_TICKS == 0 {
                match self.jobs.cleanup(self.config.retention_days).await {
                    Ok(0) => {}
                    Ok(deleted) => {
                        info!(
                            deleted,
                            retention_days = self.config.retention_days,
                            "Pruned terminal jobs"
                        );
                    }
                    Err(e) => warn!(error = %e, "Job retention cleanup failed"),
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Polling worker received shutdown signal");
                    break;
                }
                _ = sleep(interval) => {}
            }
        }
        info!("Polling worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{new_v7, JobRepository, JobStatus, JobType, QueueImportJob};
    use strata_db::memory::MemoryStore;

    use crate::handler::NoOpHandler;

    #[test]
    fn config_defaults_come_from_core() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, defaults::WORKER_POLL_INTERVAL_MS);
        assert_eq!(config.retention_days, defaults::JOB_RETENTION_DAYS);
        assert!(config.enabled);
    }

    #[test]
    fn config_builders_chain() {
        let config = WorkerConfig::default()
            .with_poll_interval(500)
            .with_retention_days(7)
            .with_enabled(false);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.retention_days, 7);
        assert!(!config.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_processes_queued_jobs_until_shutdown() {
        let db = MemoryStore::new();
        let job_id = db
            .queue_import(QueueImportJob {
                user_id: new_v7(),
                import_id: new_v7(),
            })
            .await
            .unwrap();

        let jobs: Arc<dyn JobRepository> = Arc::new(db.clone());
        let processor = Arc::new(
            QueueProcessor::new(jobs.clone())
                .with_handler(NoOpHandler::new(JobType::ImportProcessing)),
        );
        let worker = PollingWorker::new(
            processor,
            jobs,
            WorkerConfig::default().with_poll_interval(10),
        );

        let handle = worker.start();
        // Paused time auto-advances; a few virtual ticks are plenty.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await.unwrap();

        let job = JobRepository::get(&db, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_worker_never_polls() {
        let db = MemoryStore::new();
        let job_id = db
            .queue_import(QueueImportJob {
                user_id: new_v7(),
                import_id: new_v7(),
            })
            .await
            .unwrap();

        let jobs: Arc<dyn JobRepository> = Arc::new(db.clone());
        let processor = Arc::new(
            QueueProcessor::new(jobs.clone())
                .with_handler(NoOpHandler::new(JobType::ImportProcessing)),
        );
        let worker = PollingWorker::new(
            processor,
            jobs,
            WorkerConfig::default().with_poll_interval(10).with_enabled(false),
        );

        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The loop never ran, so the receiver is gone and the job is
        // untouched.
        assert!(handle.shutdown().await.is_err());
        let job = JobRepository::get(&db, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}
