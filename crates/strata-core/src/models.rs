//! Core data models for strata.
//!
//! Persisted entities (jobs, imports, conversations, messages, chunks,
//! derived structure) plus the request/response types shared between the
//! pipeline and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub use pgvector::Vector;

// =============================================================================
// JOBS
// =============================================================================

/// Job type determines which step pipeline handles the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Reduce one raw capture into conversations/messages/chunks/embeddings.
    ImportProcessing,
    /// Regenerate derived structure (thinking windows, signals) for a user.
    StructureRecompute,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ImportProcessing => "import_processing",
            JobType::StructureRecompute => "structure_recompute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import_processing" => Some(JobType::ImportProcessing),
            "structure_recompute" => Some(JobType::StructureRecompute),
            _ => None,
        }
    }
}

/// Persisted job status. `running` is implicit: a pending job with a
/// non-null lock is running; the column itself never stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Error,
    Done,
}

/// Pipeline steps for `import_processing`, in execution order.
///
/// A job's `step` column records the last *completed* step; `queued`
/// means nothing has run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStep {
    Queued,
    Parse,
    InsertConversations,
    InsertMessages,
    ChunkMessages,
    EmbedChunks,
    Finalize,
}

impl ImportStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStep::Queued => "queued",
            ImportStep::Parse => "parse",
            ImportStep::InsertConversations => "insert_conversations",
            ImportStep::InsertMessages => "insert_messages",
            ImportStep::ChunkMessages => "chunk_messages",
            ImportStep::EmbedChunks => "embed_chunks",
            ImportStep::Finalize => "finalize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ImportStep::Queued),
            "parse" => Some(ImportStep::Parse),
            "insert_conversations" => Some(ImportStep::InsertConversations),
            "insert_messages" => Some(ImportStep::InsertMessages),
            "chunk_messages" => Some(ImportStep::ChunkMessages),
            "embed_chunks" => Some(ImportStep::EmbedChunks),
            "finalize" => Some(ImportStep::Finalize),
            _ => None,
        }
    }

    /// The step to execute after this one; `None` past `finalize`.
    pub fn next(&self) -> Option<Self> {
        match self {
            ImportStep::Queued => Some(ImportStep::Parse),
            ImportStep::Parse => Some(ImportStep::InsertConversations),
            ImportStep::InsertConversations => Some(ImportStep::InsertMessages),
            ImportStep::InsertMessages => Some(ImportStep::ChunkMessages),
            ImportStep::ChunkMessages => Some(ImportStep::EmbedChunks),
            ImportStep::EmbedChunks => Some(ImportStep::Finalize),
            ImportStep::Finalize => None,
        }
    }

    /// Percent estimate once this step has completed.
    pub fn completion_percent(&self) -> i32 {
        match self {
            ImportStep::Queued => 0,
            ImportStep::Parse => 15,
            ImportStep::InsertConversations => 30,
            ImportStep::InsertMessages => 45,
            ImportStep::ChunkMessages => 60,
            ImportStep::EmbedChunks => 85,
            ImportStep::Finalize => 100,
        }
    }
}

/// Pipeline steps for `structure_recompute`, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeStep {
    Queued,
    BuildWindows,
    ScoreSignals,
    Finalize,
}

impl RecomputeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecomputeStep::Queued => "queued",
            RecomputeStep::BuildWindows => "build_windows",
            RecomputeStep::ScoreSignals => "score_signals",
            RecomputeStep::Finalize => "finalize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RecomputeStep::Queued),
            "build_windows" => Some(RecomputeStep::BuildWindows),
            "score_signals" => Some(RecomputeStep::ScoreSignals),
            "finalize" => Some(RecomputeStep::Finalize),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            RecomputeStep::Queued => Some(RecomputeStep::BuildWindows),
            RecomputeStep::BuildWindows => Some(RecomputeStep::ScoreSignals),
            RecomputeStep::ScoreSignals => Some(RecomputeStep::Finalize),
            RecomputeStep::Finalize => None,
        }
    }

    pub fn completion_percent(&self) -> i32 {
        match self {
            RecomputeStep::Queued => 0,
            RecomputeStep::BuildWindows => 40,
            RecomputeStep::ScoreSignals => 80,
            RecomputeStep::Finalize => 100,
        }
    }
}

/// Which derived state a recompute job regenerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecomputeScope {
    Windows,
    Signals,
    Full,
}

impl RecomputeScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecomputeScope::Windows => "windows",
            RecomputeScope::Signals => "signals",
            RecomputeScope::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "windows" => Some(RecomputeScope::Windows),
            "signals" => Some(RecomputeScope::Signals),
            "full" => Some(RecomputeScope::Full),
            _ => None,
        }
    }

    pub fn includes_windows(&self) -> bool {
        matches!(self, RecomputeScope::Windows | RecomputeScope::Full)
    }

    pub fn includes_signals(&self) -> bool {
        matches!(self, RecomputeScope::Signals | RecomputeScope::Full)
    }
}

/// Structured per-step progress, tagged by job type at the storage
/// boundary so neither pipeline ever decodes the other's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobProgress {
    Import(ImportProgress),
    Recompute(RecomputeProgress),
}

impl JobProgress {
    pub fn percent(&self) -> i32 {
        match self {
            JobProgress::Import(p) => p.percent,
            JobProgress::Recompute(p) => p.percent,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub conversations_inserted: i64,
    pub messages_inserted: i64,
    pub chunks_created: i64,
    pub chunks_embedded: i64,
    pub percent: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputeProgress {
    pub windows_built: i64,
    pub signals_scored: i64,
    pub percent: i32,
}

/// A persisted unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    /// Last completed pipeline step; `"queued"` before the first run.
    pub step: String,
    /// Persisted status; see [`Job::effective_status`] for the
    /// lock-derived `running` state.
    pub status: JobStatus,
    pub progress: Option<JobProgress>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub user_id: Uuid,
    /// Set for `import_processing` jobs.
    pub import_id: Option<Uuid>,
    /// Set for `structure_recompute` jobs.
    pub scope: Option<RecomputeScope>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Status with the implicit `running` state resolved: a pending job
    /// holding a lock is running.
    pub fn effective_status(&self) -> JobStatus {
        if self.status == JobStatus::Pending && self.locked_at.is_some() {
            JobStatus::Running
        } else {
            self.status
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Done | JobStatus::Error)
    }

    /// Manual retry is offered exactly for jobs in `error` status.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Error
    }
}

/// Outcome of a debounced recompute dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new pending job row was inserted.
    Created(Uuid),
    /// An unclaimed pending job for the same (user, scope) absorbed the
    /// dispatch; its reason/timestamp were overwritten.
    Merged(Uuid),
}

impl DispatchOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            DispatchOutcome::Created(id) | DispatchOutcome::Merged(id) => *id,
        }
    }
}

/// Summary of one `process_queue` invocation. Observational only;
/// callers log it or return it in a response, never branch on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Jobs claimed by this invocation (claim losers are not counted).
    pub processed: usize,
    pub job_ids: Vec<Uuid>,
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub error: i64,
    pub done_last_hour: i64,
    pub total: i64,
}

// =============================================================================
// IMPORTS (CAPTURES)
// =============================================================================

/// How a capture's raw text should be reduced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Pasted transcript or prose; role markers auto-detected.
    #[default]
    Standard,
    /// Quoted email thread; split on reply headers.
    Email,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Standard => "standard",
            CaptureMode::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(CaptureMode::Standard),
            "email" => Some(CaptureMode::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Received,
    Processing,
    Reduced,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Received => "received",
            ImportStatus::Processing => "processing",
            ImportStatus::Reduced => "reduced",
            ImportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(ImportStatus::Received),
            "processing" => Some(ImportStatus::Processing),
            "reduced" => Some(ImportStatus::Reduced),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

/// One capture: the raw text plus everything the reduction derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub mode: CaptureMode,
    pub title: Option<String>,
    pub raw_text: String,
    /// BLAKE3 hex of `raw_text`, for duplicate-capture detection.
    pub content_hash: String,
    pub status: ImportStatus,
    /// Parse-step intermediate (serialized NormalizedTranscript); read
    /// back by the insert steps so a resumed job never re-parses.
    pub normalized: Option<JsonValue>,
    pub diagnostics: Option<JsonValue>,
    pub tags: Vec<String>,
    pub tag_suggestions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// REDUCED ARTIFACTS
// =============================================================================

/// Message speaker role. The reduction recognizes exactly two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub import_id: Uuid,
    pub user_id: Uuid,
    /// Position of this conversation within its capture (0 for single-
    /// conversation captures).
    pub source_index: i32,
    pub title: Option<String>,
    pub detected_format: String,
    /// Resolved externally by the thinking-time endpoints; consumed by
    /// the recompute pipeline when present.
    pub thinking_started_at: Option<DateTime<Utc>>,
    pub thinking_ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for the idempotent conversation upsert.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub import_id: Uuid,
    pub user_id: Uuid,
    pub source_index: i32,
    pub title: Option<String>,
    pub detected_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// `index_in_conversation` from the normalizer; unique per
    /// conversation.
    pub position: i32,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub position: i32,
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageChunk {
    pub id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    /// 0-based, monotonic within the parent message.
    pub chunk_index: i32,
    pub content: String,
    pub start_offset: i32,
    pub end_offset: i32,
    pub embedded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub start_offset: i32,
    pub end_offset: i32,
}

// =============================================================================
// REDUCTION DIAGNOSTICS
// =============================================================================

/// Audit record of one capture/reduction run. Written once, never read
/// by control flow; exists so an operator can answer "what happened to
/// my paste" without replaying the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReductionDiagnostics {
    pub capture_id: Option<Uuid>,
    pub mode: String,
    pub input: InputStats,
    pub output: OutputStats,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputStats {
    pub bytes: u64,
    pub detected_format: String,
    pub role_warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputStats {
    pub conversations_extracted: i64,
    pub conversations_persisted: i64,
    pub messages_extracted: i64,
    pub messages_persisted: i64,
    pub chunks_created: i64,
    pub chunks_embedded: i64,
    pub dropped: Vec<DropRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropRecord {
    pub reason: String,
    pub count: i64,
}

// =============================================================================
// DERIVED STRUCTURE
// =============================================================================

/// A derived thinking-time window attached to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingWindow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub minutes: i32,
    pub message_count: i32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewThinkingWindow {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub minutes: i32,
    pub message_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Tension,
    Priority,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Tension => "tension",
            SignalKind::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Task,
    Decision,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Task => "task",
            SourceKind::Decision => "decision",
        }
    }
}

/// A derived tension/priority signal pointing at the task or decision
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSignal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: SignalKind,
    pub source_kind: SourceKind,
    pub source_id: Uuid,
    /// Normalized to [0, 1].
    pub score: f64,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStructureSignal {
    pub user_id: Uuid,
    pub kind: SignalKind,
    pub source_kind: SourceKind,
    pub source_id: Uuid,
    pub score: f64,
    pub reason: String,
}

/// Read-only view of a task (CRUD lives outside this system).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub status: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only view of a decision (CRUD lives outside this system).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub status: String,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// TAGGING
// =============================================================================

/// Result of best-effort tag extraction. Never an error: provider
/// failures produce an empty outcome carrying a warning instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagOutcome {
    pub tags: Vec<String>,
    pub suggestions: Vec<String>,
    pub warning: Option<String>,
}

// =============================================================================
// API REQUEST/RESPONSE TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCaptureRequest {
    pub raw_text: String,
    #[serde(default)]
    pub mode: CaptureMode,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCaptureResponse {
    pub import_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessQueueRequest {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecomputeRequest {
    pub user_id: Uuid,
    pub scope: RecomputeScope,
    pub reason: String,
}

/// Polling view of a job: effective status plus the retry affordance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub step: String,
    pub progress: Option<JobProgress>,
    pub last_error: Option<String>,
    pub can_retry: bool,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusView {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.effective_status(),
            step: job.step.clone(),
            progress: job.progress.clone(),
            last_error: job.last_error.clone(),
            can_retry: job.can_retry(),
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
