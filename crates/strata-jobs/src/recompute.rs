//! Structure recompute: debounced dispatch plus the staged pipeline
//! that rebuilds thinking windows and tension/priority signals.
//!
//! Recompute is advisory. Dispatch failures are logged and swallowed so
//! the mutation that triggered them always succeeds on its own terms,
//! and every run regenerates its scope from scratch, so a missed
//! dispatch heals on the next one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use strata_core::{
    defaults, Conversation, ConversationRepository, DecisionRecord, DecisionRepository,
    DispatchOutcome, Error, Job, JobProgress, JobRepository, JobType, MessageRepository,
    NewStructureSignal, NewThinkingWindow, QueueRecomputeJob, RecomputeProgress, RecomputeScope,
    RecomputeStep, Result, SignalKind, SourceKind, StructureRepository, TaskRecord,
    TaskRepository,
};

use crate::handler::{StepHandler, StepOutcome};

/// Queues (or merges) recompute work for a user.
pub struct RecomputeDispatcher {
    jobs: Arc<dyn JobRepository>,
}

impl RecomputeDispatcher {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }

    /// Dispatch a recompute for this user and scope. Returns `None`
    /// when the dispatch could not be recorded; callers never treat
    /// that as a failure of their own operation.
    #[instrument(
        skip(self),
        fields(subsystem = "jobs", component = "recompute", op = "dispatch", user_id = %user_id)
    )]
    pub async fn dispatch(
        &self,
        user_id: Uuid,
        scope: RecomputeScope,
        reason: &str,
    ) -> Option<DispatchOutcome> {
        let req = QueueRecomputeJob {
            user_id,
            scope,
            reason: reason.to_string(),
        };
        match self.jobs.queue_recompute(req).await {
            Ok(outcome) => {
                debug!(
                    job_id = %outcome.job_id(),
                    scope = scope.as_str(),
                    merged = matches!(outcome, DispatchOutcome::Merged(_)),
                    "Recompute dispatched"
                );
                Some(outcome)
            }
            Err(e) => {
                warn!(scope = scope.as_str(), reason, error = %e, "Recompute dispatch dropped");
                None
            }
        }
    }
}

/// Step handler for `structure_recompute` jobs.
pub struct RecomputeHandler {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    tasks: Arc<dyn TaskRepository>,
    decisions: Arc<dyn DecisionRepository>,
    structure: Arc<dyn StructureRepository>,
    session_gap: Duration,
}

impl RecomputeHandler {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        tasks: Arc<dyn TaskRepository>,
        decisions: Arc<dyn DecisionRepository>,
        structure: Arc<dyn StructureRepository>,
    ) -> Self {
        Self {
            conversations,
            messages,
            tasks,
            decisions,
            structure,
            session_gap: Duration::minutes(defaults::SESSION_GAP_MINUTES),
        }
    }

    fn scope_of(job: &Job) -> RecomputeScope {
        job.scope.unwrap_or(RecomputeScope::Full)
    }

    fn carry(job: &Job) -> RecomputeProgress {
        match &job.progress {
            Some(JobProgress::Recompute(p)) => p.clone(),
            _ => RecomputeProgress::default(),
        }
    }

    async fn step_build_windows(&self, job: &Job) -> Result<StepOutcome> {
        let scope = Self::scope_of(job);
        let mut progress = Self::carry(job);

        if scope.includes_windows() {
            let conversations = self.conversations.list_for_user(job.user_id).await?;
            let mut windows = Vec::new();
            for conversation in &conversations {
                let times: Vec<DateTime<Utc>> = self
                    .messages
                    .list_for_conversation(conversation.id)
                    .await?
                    .iter()
                    .map(|m| m.created_at)
                    .collect();
                if let Some(window) = derive_window(conversation, &times, self.session_gap) {
                    windows.push(window);
                }
            }
            progress.windows_built = self.structure.replace_windows(job.user_id, windows).await?;
        }

        progress.percent = RecomputeStep::BuildWindows.completion_percent();
        Ok(StepOutcome::Advanced {
            step: RecomputeStep::BuildWindows.as_str(),
            progress: JobProgress::Recompute(progress),
        })
    }

    async fn step_score_signals(&self, job: &Job) -> Result<StepOutcome> {
        let scope = Self::scope_of(job);
        let mut progress = Self::carry(job);

        if scope.includes_signals() {
            let tasks = self.tasks.list_open_for_user(job.user_id).await?;
            let decisions = self.decisions.list_open_for_user(job.user_id).await?;
            let signals = score_signals(Utc::now(), job.user_id, &tasks, &decisions);
            progress.signals_scored = self.structure.replace_signals(job.user_id, signals).await?;
        }

        progress.percent = RecomputeStep::ScoreSignals.completion_percent();
        Ok(StepOutcome::Advanced {
            step: RecomputeStep::ScoreSignals.as_str(),
            progress: JobProgress::Recompute(progress),
        })
    }

    async fn step_finalize(&self, job: &Job) -> Result<StepOutcome> {
        let mut progress = Self::carry(job);
        progress.percent = RecomputeStep::Finalize.completion_percent();

        info!(
            user_id = %job.user_id,
            scope = Self::scope_of(job).as_str(),
            windows = progress.windows_built,
            signals = progress.signals_scored,
            reason = job.reason.as_deref().unwrap_or(""),
            "Structure recomputed"
        );

        Ok(StepOutcome::Finished {
            step: RecomputeStep::Finalize.as_str(),
            progress: JobProgress::Recompute(progress),
        })
    }
}

#[async_trait]
impl StepHandler for RecomputeHandler {
    fn job_type(&self) -> JobType {
        JobType::StructureRecompute
    }

    #[instrument(
        skip(self, job),
        fields(subsystem = "jobs", component = "recompute", job_id = %job.id, job_step = %job.step)
    )]
    async fn run_step(&self, job: &Job) -> Result<StepOutcome> {
        let last = RecomputeStep::parse(&job.step).ok_or_else(|| {
            Error::Internal(format!(
                "job {} has unknown recompute step '{}'",
                job.id, job.step
            ))
        })?;

        match last.next() {
            Some(RecomputeStep::BuildWindows) => self.step_build_windows(job).await,
            Some(RecomputeStep::ScoreSignals) => self.step_score_signals(job).await,
            Some(RecomputeStep::Finalize) => self.step_finalize(job).await,
            // Claimed again after finalize completed but before the job
            // row was marked done; nothing left to run.
            Some(RecomputeStep::Queued) | None => Ok(StepOutcome::Finished {
                step: RecomputeStep::Finalize.as_str(),
                progress: JobProgress::Recompute(Self::carry(job)),
            }),
        }
    }
}

/// Window for one conversation: resolved thinking-time bounds when
/// present, otherwise the span of the longest message session. Returns
/// `None` for conversations with neither.
fn derive_window(
    conversation: &Conversation,
    message_times: &[DateTime<Utc>],
    gap: Duration,
) -> Option<NewThinkingWindow> {
    let (started_at, ended_at, message_count) = match (
        conversation.thinking_started_at,
        conversation.thinking_ended_at,
    ) {
        (Some(started_at), Some(ended_at)) => (started_at, ended_at, message_times.len() as i32),
        _ => longest_session(message_times, gap)?,
    };

    Some(NewThinkingWindow {
        user_id: conversation.user_id,
        conversation_id: conversation.id,
        started_at,
        ended_at,
        minutes: (ended_at - started_at).num_minutes().max(0) as i32,
        message_count,
    })
}

/// Longest run of timestamps in which consecutive entries are at most
/// `gap` apart. Needs at least two timestamps; a single instant has no
/// span. Ties keep the earliest run.
fn longest_session(
    times: &[DateTime<Utc>],
    gap: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>, i32)> {
    if times.len() < 2 {
        return None;
    }
    let mut sorted = times.to_vec();
    sorted.sort();

    let mut best_start = 0;
    let mut best_len = 1;
    let mut run_start = 0;
    for i in 1..sorted.len() {
        if sorted[i] - sorted[i - 1] > gap {
            run_start = i;
        }
        let run_len = i - run_start + 1;
        if run_len > best_len {
            best_start = run_start;
            best_len = run_len;
        }
    }

    if best_len < 2 {
        return None;
    }
    Some((
        sorted[best_start],
        sorted[best_start + best_len - 1],
        best_len as i32,
    ))
}

/// Tension/priority signals for one user's open tasks and decisions.
///
/// Priority covers tasks due within [`defaults::PRIORITY_DUE_SOON_HOURS`]:
/// the score rises linearly from 0 at the horizon to 1 at the deadline,
/// and overdue tasks pin it at 1. Tension covers overdue tasks and
/// decisions open longer than [`defaults::TENSION_STALE_DAYS`], ramping
/// to 1 at [`defaults::TENSION_SATURATION_DAYS`].
fn score_signals(
    now: DateTime<Utc>,
    user_id: Uuid,
    tasks: &[TaskRecord],
    decisions: &[DecisionRecord],
) -> Vec<NewStructureSignal> {
    let horizon = Duration::hours(defaults::PRIORITY_DUE_SOON_HOURS);
    let stale = defaults::TENSION_STALE_DAYS as f64;
    let saturation = defaults::TENSION_SATURATION_DAYS as f64;

    let mut signals = Vec::new();

    for task in tasks {
        let Some(due_at) = task.due_at else { continue };
        let until = due_at - now;

        if until <= Duration::zero() {
            let overdue_days = fractional_days(now - due_at);
            signals.push(NewStructureSignal {
                user_id,
                kind: SignalKind::Priority,
                source_kind: SourceKind::Task,
                source_id: task.id,
                score: 1.0,
                reason: "task overdue".to_string(),
            });
            signals.push(NewStructureSignal {
                user_id,
                kind: SignalKind::Tension,
                source_kind: SourceKind::Task,
                source_id: task.id,
                score: linear_ramp(overdue_days, 0.0, saturation),
                reason: format!("overdue for {}d", (now - due_at).num_days()),
            });
        } else if until <= horizon {
            let score = 1.0 - until.num_minutes() as f64 / horizon.num_minutes() as f64;
            signals.push(NewStructureSignal {
                user_id,
                kind: SignalKind::Priority,
                source_kind: SourceKind::Task,
                source_id: task.id,
                score: score.clamp(0.0, 1.0),
                reason: format!("due in {}h", until.num_hours().max(1)),
            });
        }
    }

    for decision in decisions {
        let age = now - decision.created_at;
        let age_days = fractional_days(age);
        if age_days > stale {
            signals.push(NewStructureSignal {
                user_id,
                kind: SignalKind::Tension,
                source_kind: SourceKind::Decision,
                source_id: decision.id,
                score: linear_ramp(age_days, stale, saturation),
                reason: format!("open for {}d", age.num_days()),
            });
        }
    }

    signals
}

fn fractional_days(duration: Duration) -> f64 {
    duration.num_minutes() as f64 / (24.0 * 60.0)
}

/// 0 at `start`, 1 at `end`, linear in between, clamped outside.
fn linear_ramp(value: f64, start: f64, end: f64) -> f64 {
    ((value - start) / (end - start)).clamp(0.0, 1.0)
}
