//! Step handler contract between the queue processor and the pipelines.
//!
//! A handler executes exactly one pipeline step per invocation and tells
//! the processor what it did. All job-row bookkeeping (progress,
//! completion, failure) belongs to the processor; handlers only perform
//! their domain writes.

use async_trait::async_trait;

use strata_core::{
    Error, ImportProgress, ImportStep, Job, JobProgress, JobType, RecomputeProgress,
    RecomputeStep, Result,
};

/// What one handler invocation accomplished.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The named step completed and more steps remain.
    Advanced {
        step: &'static str,
        progress: JobProgress,
    },
    /// The terminal step completed; the job is done.
    Finished {
        step: &'static str,
        progress: JobProgress,
    },
}

impl StepOutcome {
    /// The step that just completed.
    pub fn step(&self) -> &'static str {
        match self {
            StepOutcome::Advanced { step, .. } | StepOutcome::Finished { step, .. } => step,
        }
    }

    pub fn progress(&self) -> &JobProgress {
        match self {
            StepOutcome::Advanced { progress, .. } | StepOutcome::Finished { progress, .. } => {
                progress
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, StepOutcome::Finished { .. })
    }
}

/// Executes pipeline steps for one job type.
///
/// `job.step` names the last step that completed; the handler runs the
/// step after it. Running one step per invocation keeps each database
/// write small and lets a retried job resume where it stopped instead
/// of repeating finished work.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The job type this handler executes.
    fn job_type(&self) -> JobType;

    /// Run the single step after the job's last completed one.
    async fn run_step(&self, job: &Job) -> Result<StepOutcome>;

    /// Whether this handler can execute the given job type.
    fn can_handle(&self, job_type: JobType) -> bool {
        self.job_type() == job_type
    }
}

/// Handler that walks a job's step chain without doing any work.
///
/// Exercises queue mechanics (claiming, progress, completion) in tests
/// that do not care about pipeline semantics.
pub struct NoOpHandler {
    job_type: JobType,
}

impl NoOpHandler {
    pub fn new(job_type: JobType) -> Self {
        Self { job_type }
    }

    fn import_progress(step: ImportStep) -> JobProgress {
        JobProgress::Import(ImportProgress {
            percent: step.completion_percent(),
            ..Default::default()
        })
    }

    fn recompute_progress(step: RecomputeStep) -> JobProgress {
        JobProgress::Recompute(RecomputeProgress {
            percent: step.completion_percent(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl StepHandler for NoOpHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn run_step(&self, job: &Job) -> Result<StepOutcome> {
        match self.job_type {
            JobType::ImportProcessing => {
                let last = ImportStep::parse(&job.step).ok_or_else(|| {
                    Error::Internal(format!("job {} has unknown step '{}'", job.id, job.step))
                })?;
                match last.next() {
                    Some(step) if step.next().is_some() => Ok(StepOutcome::Advanced {
                        step: step.as_str(),
                        progress: Self::import_progress(step),
                    }),
                    Some(step) => Ok(StepOutcome::Finished {
                        step: step.as_str(),
                        progress: Self::import_progress(step),
                    }),
                    None => Ok(StepOutcome::Finished {
                        step: ImportStep::Finalize.as_str(),
                        progress: Self::import_progress(ImportStep::Finalize),
                    }),
                }
            }
            JobType::StructureRecompute => {
                let last = RecomputeStep::parse(&job.step).ok_or_else(|| {
                    Error::Internal(format!("job {} has unknown step '{}'", job.id, job.step))
                })?;
                match last.next() {
                    Some(step) if step.next().is_some() => Ok(StepOutcome::Advanced {
                        step: step.as_str(),
                        progress: Self::recompute_progress(step),
                    }),
                    Some(step) => Ok(StepOutcome::Finished {
                        step: step.as_str(),
                        progress: Self::recompute_progress(step),
                    }),
                    None => Ok(StepOutcome::Finished {
                        step: RecomputeStep::Finalize.as_str(),
                        progress: Self::recompute_progress(RecomputeStep::Finalize),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_core::{new_v7, JobStatus};

    fn queued_job(job_type: JobType) -> Job {
        let now = Utc::now();
        Job {
            id: new_v7(),
            job_type,
            step: "queued".to_string(),
            status: JobStatus::Pending,
            progress: None,
            last_error: None,
            locked_at: None,
            attempt_count: 0,
            user_id: new_v7(),
            import_id: None,
            scope: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn noop_walks_the_import_chain_in_order() {
        let handler = NoOpHandler::new(JobType::ImportProcessing);
        let mut job = queued_job(JobType::ImportProcessing);

        let mut steps = Vec::new();
        loop {
            let outcome = handler.run_step(&job).await.unwrap();
            steps.push(outcome.step());
            job.step = outcome.step().to_string();
            if outcome.is_finished() {
                assert_eq!(outcome.progress().percent(), 100);
                break;
            }
        }

        assert_eq!(
            steps,
            vec![
                "parse",
                "insert_conversations",
                "insert_messages",
                "chunk_messages",
                "embed_chunks",
                "finalize"
            ]
        );
    }

    #[tokio::test]
    async fn noop_finishes_again_when_already_past_the_last_step() {
        let handler = NoOpHandler::new(JobType::StructureRecompute);
        let mut job = queued_job(JobType::StructureRecompute);
        job.step = "finalize".to_string();

        let outcome = handler.run_step(&job).await.unwrap();
        assert!(outcome.is_finished());
        assert_eq!(outcome.step(), "finalize");
    }

    #[tokio::test]
    async fn noop_rejects_unknown_steps() {
        let handler = NoOpHandler::new(JobType::ImportProcessing);
        let mut job = queued_job(JobType::ImportProcessing);
        job.step = "defragment".to_string();

        let err = handler.run_step(&job).await.unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn can_handle_matches_on_job_type() {
        let handler = NoOpHandler::new(JobType::ImportProcessing);
        assert!(handler.can_handle(JobType::ImportProcessing));
        assert!(!handler.can_handle(JobType::StructureRecompute));
    }
}
