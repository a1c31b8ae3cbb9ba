//! Core traits for strata abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability. Each
//! persisted entity gets its own typed repository; generic key/value
//! style accessors are deliberately absent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Insert payload for a new import-processing job.
#[derive(Debug, Clone)]
pub struct QueueImportJob {
    pub user_id: Uuid,
    pub import_id: Uuid,
}

/// Insert-or-merge payload for a debounced recompute dispatch.
#[derive(Debug, Clone)]
pub struct QueueRecomputeJob {
    pub user_id: Uuid,
    pub scope: RecomputeScope,
    pub reason: String,
}

/// Repository for the persisted job queue.
///
/// Claiming is atomic and lock-based: exactly one caller wins a given
/// job, and everything after the claim assumes single ownership.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue an import-processing job at step `queued`.
    async fn queue_import(&self, req: QueueImportJob) -> Result<Uuid>;

    /// Queue a recompute job, merging into an existing unclaimed
    /// pending job for the same (user, scope) when one exists.
    async fn queue_recompute(&self, req: QueueRecomputeJob) -> Result<DispatchOutcome>;

    /// List claimable jobs, oldest first, optionally restricted to one
    /// job type. A job is claimable when its status is pending and it
    /// holds no lock.
    async fn list_claimable(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<Job>>;

    /// Attempt to claim a job. Returns `true` exactly once per
    /// claimable job; losers get `false`, never an error.
    async fn claim(&self, job_id: Uuid) -> Result<bool>;

    /// Record the last completed step and structured progress.
    /// Requires the caller to hold the claim.
    async fn record_progress(
        &self,
        job_id: Uuid,
        step: &str,
        progress: &JobProgress,
    ) -> Result<()>;

    /// Mark a job done and release its lock.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job errored: store the message, bump `attempt_count`,
    /// release the lock.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Re-queue an errored job from its last recorded step, clearing
    /// error state and attempt count. Rejects jobs not in error.
    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Job>;

    /// Fail jobs whose lock is older than `lease`. Returns the ids of
    /// the jobs swept.
    async fn reclaim_stale(&self, lease: chrono::Duration) -> Result<Vec<Uuid>>;

    /// Get a job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List a user's most recent jobs, newest first, optionally
    /// filtered by type.
    async fn list_recent_for_user(
        &self,
        user_id: Uuid,
        job_type: Option<JobType>,
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// Get queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Delete terminal jobs older than `keep_days`. Returns the number
    /// deleted.
    async fn cleanup(&self, keep_days: i32) -> Result<i64>;
}

// =============================================================================
// IMPORT REPOSITORY
// =============================================================================

/// Insert payload for a new capture.
#[derive(Debug, Clone)]
pub struct CreateImport {
    pub user_id: Uuid,
    pub mode: CaptureMode,
    pub title: Option<String>,
    pub raw_text: String,
    pub content_hash: String,
}

/// Repository for captures and their reduction state.
#[async_trait]
pub trait ImportRepository: Send + Sync {
    /// Insert a new capture in `received` status.
    async fn create(&self, req: CreateImport) -> Result<Uuid>;

    /// Fetch a capture by ID.
    async fn get(&self, id: Uuid) -> Result<Option<ImportRecord>>;

    /// Update capture status.
    async fn set_status(&self, id: Uuid, status: ImportStatus) -> Result<()>;

    /// Store the parse-step output so later steps and resumed jobs can
    /// read it back without re-parsing.
    async fn store_normalized(&self, id: Uuid, normalized: &JsonValue) -> Result<()>;

    /// Store the reduction diagnostics document.
    async fn store_diagnostics(&self, id: Uuid, diagnostics: &JsonValue) -> Result<()>;

    /// Store extracted tags and unmatched suggestions.
    async fn store_tags(
        &self,
        id: Uuid,
        tags: &[String],
        suggestions: &[String],
    ) -> Result<()>;

    /// Find a prior capture with the same content hash for a user.
    async fn find_by_content_hash(&self, user_id: Uuid, hash: &str) -> Result<Option<Uuid>>;
}

// =============================================================================
// CONVERSATION / MESSAGE / CHUNK REPOSITORIES
// =============================================================================

/// Repository for reduced conversations.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Insert a conversation, or return the existing row for the same
    /// (import, source_index). Safe to repeat on job resume.
    async fn upsert(&self, conv: NewConversation) -> Result<Uuid>;

    /// List conversations for a capture, by source index.
    async fn list_for_import(&self, import_id: Uuid) -> Result<Vec<Conversation>>;

    /// List all of a user's conversations, oldest first. The recompute
    /// pipeline partitions these by thinking-time resolution.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>>;

    /// Set the externally resolved thinking-time bounds.
    async fn set_thinking_time(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Repository for conversation messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert messages, skipping any (conversation, position) that
    /// already exists. Returns the number actually inserted.
    async fn insert_many(&self, messages: Vec<NewMessage>) -> Result<i64>;

    /// List messages for a conversation in position order.
    async fn list_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<ConversationMessage>>;

    /// Count messages across all conversations of a capture.
    async fn count_for_import(&self, import_id: Uuid) -> Result<i64>;
}

/// Repository for message chunks and their embeddings.
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Insert chunks, skipping any (message, chunk_index) that already
    /// exists. Returns the number actually inserted.
    async fn insert_many(&self, chunks: Vec<NewChunk>) -> Result<i64>;

    /// List chunks of a capture that still lack an embedding, in
    /// (conversation, message, chunk_index) order.
    async fn list_unembedded_for_import(&self, import_id: Uuid) -> Result<Vec<MessageChunk>>;

    /// Store one chunk's embedding and stamp `embedded_at`.
    async fn store_embedding(&self, chunk_id: Uuid, embedding: &Vector) -> Result<()>;

    /// Count chunks for a capture, total and embedded.
    async fn embedding_counts_for_import(&self, import_id: Uuid) -> Result<(i64, i64)>;
}

// =============================================================================
// STRUCTURE REPOSITORIES
// =============================================================================

/// Read-only view over a user's tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// List a user's open tasks.
    async fn list_open_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>>;
}

/// Read-only view over a user's decisions.
#[async_trait]
pub trait DecisionRepository: Send + Sync {
    /// List a user's open decisions.
    async fn list_open_for_user(&self, user_id: Uuid) -> Result<Vec<DecisionRecord>>;
}

/// Repository for derived structure. Writes are replace-all per user so
/// a recompute run reflects exactly the current inputs.
#[async_trait]
pub trait StructureRepository: Send + Sync {
    /// Replace a user's thinking windows. Returns the number written.
    async fn replace_windows(&self, user_id: Uuid, windows: Vec<NewThinkingWindow>)
        -> Result<i64>;

    /// Replace a user's structure signals. Returns the number written.
    async fn replace_signals(
        &self,
        user_id: Uuid,
        signals: Vec<NewStructureSignal>,
    ) -> Result<i64>;

    /// List a user's thinking windows, newest first.
    async fn list_windows(&self, user_id: Uuid) -> Result<Vec<ThinkingWindow>>;

    /// List a user's signals, highest score first.
    async fn list_signals(&self, user_id: Uuid) -> Result<Vec<StructureSignal>>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts.
    ///
    /// Returns one vector per input text, in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Get the expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Best-effort tag extraction over a capture's content.
///
/// Implementations never return `Err`; provider failures come back as
/// an empty [`TagOutcome`] with `warning` set, so the enclosing
/// pipeline step cannot be failed by tagging.
#[async_trait]
pub trait TagExtractor: Send + Sync {
    /// Extract tags for a capture from its title and a sample of its
    /// message bodies.
    async fn extract(&self, title: Option<&str>, messages: &[String]) -> TagOutcome;
}
