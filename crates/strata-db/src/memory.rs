//! In-memory repository implementations for pipeline tests.
//!
//! [`MemoryStore`] implements every repository trait over one shared
//! `Arc<Mutex<..>>` state, so a cloned store handed to the processor as
//! several trait objects still observes a single coherent database.
//! Semantics mirror the Postgres implementations, including the lock
//! protocol and the idempotent insert conflicts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use strata_core::{
    new_v7, ChunkRepository, Conversation, ConversationMessage, ConversationRepository,
    CreateImport, DecisionRecord, DecisionRepository, DispatchOutcome, Error, ImportRecord,
    ImportRepository, ImportStatus, Job, JobProgress, JobRepository, JobStatus, JobType,
    MessageChunk, MessageRepository, NewChunk, NewConversation, NewMessage, NewStructureSignal,
    NewThinkingWindow, QueueImportJob, QueueRecomputeJob, QueueStats, Result, StructureRepository,
    StructureSignal, TaskRecord, TaskRepository, ThinkingWindow,
};

#[derive(Clone)]
struct StoredChunk {
    chunk: MessageChunk,
    embedding: Option<Vector>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    imports: HashMap<Uuid, ImportRecord>,
    conversations: Vec<Conversation>,
    messages: Vec<ConversationMessage>,
    chunks: Vec<StoredChunk>,
    tasks: Vec<TaskRecord>,
    decisions: Vec<DecisionRecord>,
    windows: Vec<ThinkingWindow>,
    signals: Vec<StructureSignal>,
}

/// Shared in-memory database. Cloning shares state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    /// Seed a task row, as the external CRUD surface would.
    pub fn insert_task(&self, task: TaskRecord) {
        self.lock().tasks.push(task);
    }

    /// Seed a decision row, as the external CRUD surface would.
    pub fn insert_decision(&self, decision: DecisionRecord) {
        self.lock().decisions.push(decision);
    }

    /// Number of chunk rows currently carrying an embedding.
    pub fn embedded_chunk_count(&self) -> i64 {
        self.lock()
            .chunks
            .iter()
            .filter(|c| c.embedding.is_some())
            .count() as i64
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn queue_import(&self, req: QueueImportJob) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();
        self.lock().jobs.insert(
            id,
            Job {
                id,
                job_type: JobType::ImportProcessing,
                step: "queued".to_string(),
                status: JobStatus::Pending,
                progress: None,
                last_error: None,
                locked_at: None,
                attempt_count: 0,
                user_id: req.user_id,
                import_id: Some(req.import_id),
                scope: None,
                reason: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn queue_recompute(&self, req: QueueRecomputeJob) -> Result<DispatchOutcome> {
        let now = Utc::now();
        let mut inner = self.lock();

        let mergeable = inner.jobs.values_mut().find(|j| {
            j.job_type == JobType::StructureRecompute
                && j.user_id == req.user_id
                && j.scope == Some(req.scope)
                && j.status == JobStatus::Pending
                && j.locked_at.is_none()
        });

        if let Some(job) = mergeable {
            job.reason = Some(req.reason);
            job.updated_at = now;
            return Ok(DispatchOutcome::Merged(job.id));
        }

        let id = new_v7();
        inner.jobs.insert(
            id,
            Job {
                id,
                job_type: JobType::StructureRecompute,
                step: "queued".to_string(),
                status: JobStatus::Pending,
                progress: None,
                last_error: None,
                locked_at: None,
                attempt_count: 0,
                user_id: req.user_id,
                import_id: None,
                scope: Some(req.scope),
                reason: Some(req.reason),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(DispatchOutcome::Created(id))
    }

    async fn list_claimable(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut claimable: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.locked_at.is_none())
            .filter(|j| job_type.is_none_or(|t| j.job_type == t))
            .cloned()
            .collect();
        // v7 ids are time-ordered, so the id tiebreak keeps same-instant
        // jobs in insertion order.
        claimable.sort_by_key(|j| (j.created_at, j.id));
        claimable.truncate(limit.max(0) as usize);
        Ok(claimable)
    }

    async fn claim(&self, job_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending && job.locked_at.is_none() => {
                job.locked_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        step: &str,
        progress: &JobProgress,
    ) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending && job.locked_at.is_some() => {
                job.step = step.to_string();
                job.progress = Some(progress.clone());
                job.updated_at = now;
                Ok(())
            }
            _ => Err(Error::StaleLock(format!(
                "job {} is no longer held; progress for step '{}' dropped",
                job_id, step
            ))),
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending && job.locked_at.is_some() => {
                job.status = JobStatus::Done;
                job.locked_at = None;
                job.updated_at = now;
                Ok(())
            }
            _ => Err(Error::StaleLock(format!(
                "job {} is no longer held; completion dropped",
                job_id
            ))),
        }
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Error;
                job.last_error = Some(error.to_string());
                job.attempt_count += 1;
                job.locked_at = None;
                job.updated_at = now;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(Error::JobNotFound(job_id)),
        }
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Error => {
                job.status = JobStatus::Pending;
                job.last_error = None;
                job.locked_at = None;
                job.attempt_count = 0;
                job.updated_at = now;
                Ok(job.clone())
            }
            Some(job) => Err(Error::Validation(format!(
                "job {} has status '{:?}'; only errored jobs can be retried",
                job_id,
                job.effective_status()
            ))),
            None => Err(Error::JobNotFound(job_id)),
        }
    }

    async fn reclaim_stale(&self, lease: chrono::Duration) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let cutoff = now - lease;
        let mut inner = self.lock();
        let mut swept = Vec::new();

        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Pending
                && job.locked_at.map(|t| t < cutoff).unwrap_or(false)
            {
                job.status = JobStatus::Error;
                job.last_error = Some("lock lease expired".to_string());
                job.attempt_count += 1;
                job.locked_at = None;
                job.updated_at = now;
                swept.push(job.id);
            }
        }

        Ok(swept)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_recent_for_user(
        &self,
        user_id: Uuid,
        job_type: Option<JobType>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .filter(|j| job_type.map_or(true, |t| j.job_type == t))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let inner = self.lock();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let mut stats = QueueStats {
            pending: 0,
            running: 0,
            error: 0,
            done_last_hour: 0,
            total: 0,
        };
        for job in inner.jobs.values() {
            stats.total += 1;
            match (job.status, job.locked_at) {
                (JobStatus::Pending, None) => stats.pending += 1,
                (JobStatus::Pending, Some(_)) => stats.running += 1,
                (JobStatus::Error, _) => stats.error += 1,
                (JobStatus::Done, _) => {
                    if job.updated_at > hour_ago {
                        stats.done_last_hour += 1;
                    }
                }
                (JobStatus::Running, _) => {}
            }
        }
        Ok(stats)
    }

    async fn cleanup(&self, keep_days: i32) -> Result<i64> {
        let cutoff = Utc::now() - chrono::Duration::days(keep_days as i64);
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| {
            !(matches!(j.status, JobStatus::Done | JobStatus::Error) && j.updated_at < cutoff)
        });
        Ok((before - inner.jobs.len()) as i64)
    }
}

#[async_trait]
impl ImportRepository for MemoryStore {
    async fn create(&self, req: CreateImport) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();
        self.lock().imports.insert(
            id,
            ImportRecord {
                id,
                user_id: req.user_id,
                mode: req.mode,
                title: req.title,
                raw_text: req.raw_text,
                content_hash: req.content_hash,
                status: ImportStatus::Received,
                normalized: None,
                diagnostics: None,
                tags: Vec::new(),
                tag_suggestions: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImportRecord>> {
        Ok(self.lock().imports.get(&id).cloned())
    }

    async fn set_status(&self, id: Uuid, status: ImportStatus) -> Result<()> {
        let mut inner = self.lock();
        let import = inner.imports.get_mut(&id).ok_or(Error::ImportNotFound(id))?;
        import.status = status;
        import.updated_at = Utc::now();
        Ok(())
    }

    async fn store_normalized(&self, id: Uuid, normalized: &JsonValue) -> Result<()> {
        let mut inner = self.lock();
        let import = inner.imports.get_mut(&id).ok_or(Error::ImportNotFound(id))?;
        import.normalized = Some(normalized.clone());
        import.updated_at = Utc::now();
        Ok(())
    }

    async fn store_diagnostics(&self, id: Uuid, diagnostics: &JsonValue) -> Result<()> {
        let mut inner = self.lock();
        let import = inner.imports.get_mut(&id).ok_or(Error::ImportNotFound(id))?;
        import.diagnostics = Some(diagnostics.clone());
        import.updated_at = Utc::now();
        Ok(())
    }

    async fn store_tags(&self, id: Uuid, tags: &[String], suggestions: &[String]) -> Result<()> {
        let mut inner = self.lock();
        let import = inner.imports.get_mut(&id).ok_or(Error::ImportNotFound(id))?;
        import.tags = tags.to_vec();
        import.tag_suggestions = suggestions.to_vec();
        import.updated_at = Utc::now();
        Ok(())
    }

    async fn find_by_content_hash(&self, user_id: Uuid, hash: &str) -> Result<Option<Uuid>> {
        let inner = self.lock();
        Ok(inner
            .imports
            .values()
            .filter(|i| i.user_id == user_id && i.content_hash == hash)
            .max_by_key(|i| (i.created_at, i.id))
            .map(|i| i.id))
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn upsert(&self, conv: NewConversation) -> Result<Uuid> {
        let now = Utc::now();
        let mut inner = self.lock();

        if let Some(existing) = inner
            .conversations
            .iter_mut()
            .find(|c| c.import_id == conv.import_id && c.source_index == conv.source_index)
        {
            existing.updated_at = now;
            return Ok(existing.id);
        }

        let id = new_v7();
        inner.conversations.push(Conversation {
            id,
            import_id: conv.import_id,
            user_id: conv.user_id,
            source_index: conv.source_index,
            title: conv.title,
            detected_format: conv.detected_format,
            thinking_started_at: None,
            thinking_ended_at: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn list_for_import(&self, import_id: Uuid) -> Result<Vec<Conversation>> {
        let inner = self.lock();
        let mut convs: Vec<Conversation> = inner
            .conversations
            .iter()
            .filter(|c| c.import_id == import_id)
            .cloned()
            .collect();
        convs.sort_by_key(|c| c.source_index);
        Ok(convs)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let inner = self.lock();
        let mut convs: Vec<Conversation> = inner
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        convs.sort_by_key(|c| (c.created_at, c.id));
        Ok(convs)
    }

    async fn set_thinking_time(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<()> {
        if ended_at < started_at {
            return Err(Error::Validation(format!(
                "thinking time ends ({}) before it starts ({})",
                ended_at, started_at
            )));
        }
        let mut inner = self.lock();
        let conv = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))?;
        conv.thinking_started_at = Some(started_at);
        conv.thinking_ended_at = Some(ended_at);
        conv.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert_many(&self, messages: Vec<NewMessage>) -> Result<i64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut inserted = 0i64;

        for message in messages {
            let exists = inner.messages.iter().any(|m| {
                m.conversation_id == message.conversation_id && m.position == message.position
            });
            if exists {
                continue;
            }
            inner.messages.push(ConversationMessage {
                id: new_v7(),
                conversation_id: message.conversation_id,
                position: message.position,
                role: message.role,
                content: message.content,
                created_at: now,
            });
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn list_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>> {
        let inner = self.lock();
        let mut messages: Vec<ConversationMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.position);
        Ok(messages)
    }

    async fn count_for_import(&self, import_id: Uuid) -> Result<i64> {
        let inner = self.lock();
        let conversation_ids: Vec<Uuid> = inner
            .conversations
            .iter()
            .filter(|c| c.import_id == import_id)
            .map(|c| c.id)
            .collect();
        Ok(inner
            .messages
            .iter()
            .filter(|m| conversation_ids.contains(&m.conversation_id))
            .count() as i64)
    }
}

#[async_trait]
impl ChunkRepository for MemoryStore {
    async fn insert_many(&self, chunks: Vec<NewChunk>) -> Result<i64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut inserted = 0i64;

        for chunk in chunks {
            let exists = inner.chunks.iter().any(|c| {
                c.chunk.message_id == chunk.message_id && c.chunk.chunk_index == chunk.chunk_index
            });
            if exists {
                continue;
            }
            inner.chunks.push(StoredChunk {
                chunk: MessageChunk {
                    id: new_v7(),
                    message_id: chunk.message_id,
                    conversation_id: chunk.conversation_id,
                    chunk_index: chunk.chunk_index,
                    content: chunk.content,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    embedded_at: None,
                    created_at: now,
                },
                embedding: None,
            });
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn list_unembedded_for_import(&self, import_id: Uuid) -> Result<Vec<MessageChunk>> {
        let inner = self.lock();
        let conversation_ids: Vec<Uuid> = inner
            .conversations
            .iter()
            .filter(|c| c.import_id == import_id)
            .map(|c| c.id)
            .collect();
        let mut chunks: Vec<MessageChunk> = inner
            .chunks
            .iter()
            .filter(|c| {
                c.embedding.is_none() && conversation_ids.contains(&c.chunk.conversation_id)
            })
            .map(|c| c.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| (c.conversation_id, c.message_id, c.chunk_index));
        Ok(chunks)
    }

    async fn store_embedding(&self, chunk_id: Uuid, embedding: &Vector) -> Result<()> {
        let mut inner = self.lock();
        let stored = inner
            .chunks
            .iter_mut()
            .find(|c| c.chunk.id == chunk_id)
            .ok_or_else(|| Error::NotFound(format!("chunk {}", chunk_id)))?;
        stored.embedding = Some(embedding.clone());
        stored.chunk.embedded_at = Some(Utc::now());
        Ok(())
    }

    async fn embedding_counts_for_import(&self, import_id: Uuid) -> Result<(i64, i64)> {
        let inner = self.lock();
        let conversation_ids: Vec<Uuid> = inner
            .conversations
            .iter()
            .filter(|c| c.import_id == import_id)
            .map(|c| c.id)
            .collect();
        let mut total = 0i64;
        let mut embedded = 0i64;
        for chunk in &inner.chunks {
            if conversation_ids.contains(&chunk.chunk.conversation_id) {
                total += 1;
                if chunk.embedding.is_some() {
                    embedded += 1;
                }
            }
        }
        Ok((total, embedded))
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn list_open_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>> {
        let inner = self.lock();
        let mut tasks: Vec<TaskRecord> = inner
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id && t.status == "open")
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.due_at.is_none(), t.due_at, t.created_at));
        Ok(tasks)
    }
}

#[async_trait]
impl DecisionRepository for MemoryStore {
    async fn list_open_for_user(&self, user_id: Uuid) -> Result<Vec<DecisionRecord>> {
        let inner = self.lock();
        let mut decisions: Vec<DecisionRecord> = inner
            .decisions
            .iter()
            .filter(|d| d.user_id == user_id && d.status == "open")
            .cloned()
            .collect();
        decisions.sort_by_key(|d| d.created_at);
        Ok(decisions)
    }
}

#[async_trait]
impl StructureRepository for MemoryStore {
    async fn replace_windows(
        &self,
        user_id: Uuid,
        windows: Vec<NewThinkingWindow>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.windows.retain(|w| w.user_id != user_id);
        let written = windows.len() as i64;
        for window in windows {
            inner.windows.push(ThinkingWindow {
                id: new_v7(),
                user_id: window.user_id,
                conversation_id: window.conversation_id,
                started_at: window.started_at,
                ended_at: window.ended_at,
                minutes: window.minutes,
                message_count: window.message_count,
                computed_at: now,
            });
        }
        Ok(written)
    }

    async fn replace_signals(
        &self,
        user_id: Uuid,
        signals: Vec<NewStructureSignal>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.signals.retain(|s| s.user_id != user_id);
        let written = signals.len() as i64;
        for signal in signals {
            inner.signals.push(StructureSignal {
                id: new_v7(),
                user_id: signal.user_id,
                kind: signal.kind,
                source_kind: signal.source_kind,
                source_id: signal.source_id,
                score: signal.score,
                reason: signal.reason,
                computed_at: now,
            });
        }
        Ok(written)
    }

    async fn list_windows(&self, user_id: Uuid) -> Result<Vec<ThinkingWindow>> {
        let inner = self.lock();
        let mut windows: Vec<ThinkingWindow> = inner
            .windows
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        windows.sort_by_key(|w| std::cmp::Reverse(w.started_at));
        Ok(windows)
    }

    async fn list_signals(&self, user_id: Uuid) -> Result<Vec<StructureSignal>> {
        let inner = self.lock();
        let mut signals: Vec<StructureSignal> = inner
            .signals
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        signals.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(signals)
    }
}
