//! Import pipeline: reduces one raw capture into conversations,
//! messages, chunks and embeddings, one step per invocation.
//!
//! Every step rereads its inputs from the store and writes
//! idempotently, so a job resumed after a crash or failed attempt picks
//! up exactly where it stopped without duplicating artifacts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use strata_core::{
    defaults, CaptureMode, ChunkRepository, ConversationRepository, DropRecord, EmbeddingBackend,
    Error, ImportProgress, ImportRecord, ImportRepository, ImportStatus, ImportStep, InputStats,
    Job, JobProgress, JobType, MessageRepository, NewChunk, NewConversation, NewMessage,
    OutputStats, ReductionDiagnostics, Result, TagExtractor,
};
use strata_ingest::{
    chunk_text, normalize, normalize_email_thread, role_ambiguity, NormalizedTranscript,
};

use crate::handler::{StepHandler, StepOutcome};

/// Tuning for the import pipeline.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Chunks sent per embedding request.
    pub embed_batch_size: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: defaults::EMBED_BATCH_SIZE,
        }
    }
}

impl ImportConfig {
    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }
}

/// Step handler for `import_processing` jobs.
pub struct ImportHandler {
    imports: Arc<dyn ImportRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    chunks: Arc<dyn ChunkRepository>,
    embedder: Arc<dyn EmbeddingBackend>,
    tagger: Arc<dyn TagExtractor>,
    config: ImportConfig,
}

impl ImportHandler {
    pub fn new(
        imports: Arc<dyn ImportRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        chunks: Arc<dyn ChunkRepository>,
        embedder: Arc<dyn EmbeddingBackend>,
        tagger: Arc<dyn TagExtractor>,
    ) -> Self {
        Self {
            imports,
            conversations,
            messages,
            chunks,
            embedder,
            tagger,
            config: ImportConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    async fn load_import(&self, job: &Job) -> Result<ImportRecord> {
        let import_id = job
            .import_id
            .ok_or_else(|| Error::Internal(format!("job {} carries no import id", job.id)))?;
        self.imports
            .get(import_id)
            .await?
            .ok_or(Error::ImportNotFound(import_id))
    }

    /// The parse-step transcript read back from the store.
    fn transcript_of(import: &ImportRecord) -> Result<NormalizedTranscript> {
        let normalized = import.normalized.clone().ok_or_else(|| {
            Error::StepProcessing(format!(
                "capture {} has no stored transcript; parse must complete first",
                import.id
            ))
        })?;
        serde_json::from_value(normalized).map_err(|e| {
            Error::StepProcessing(format!(
                "stored transcript for capture {} is unreadable: {}",
                import.id, e
            ))
        })
    }

    /// Parse-step diagnostics read back, or a fresh document when
    /// missing or unreadable.
    fn diagnostics_of(import: &ImportRecord) -> ReductionDiagnostics {
        import
            .diagnostics
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| ReductionDiagnostics {
                capture_id: Some(import.id),
                mode: import.mode.as_str().to_string(),
                ..Default::default()
            })
    }

    /// Progress carried over from the previous step.
    fn carry(job: &Job) -> ImportProgress {
        match &job.progress {
            Some(JobProgress::Import(p)) => p.clone(),
            _ => ImportProgress::default(),
        }
    }

    fn advanced(job: &Job, step: ImportStep, update: impl FnOnce(&mut ImportProgress)) -> StepOutcome {
        let mut progress = Self::carry(job);
        update(&mut progress);
        progress.percent = step.completion_percent();
        StepOutcome::Advanced {
            step: step.as_str(),
            progress: JobProgress::Import(progress),
        }
    }

    async fn step_parse(&self, job: &Job) -> Result<StepOutcome> {
        let import = self.load_import(job).await?;
        self.imports
            .set_status(import.id, ImportStatus::Processing)
            .await?;

        let transcript = match import.mode {
            CaptureMode::Standard => normalize(&import.raw_text),
            CaptureMode::Email => normalize_email_thread(&import.raw_text),
        };

        let mut diagnostics = ReductionDiagnostics {
            capture_id: Some(import.id),
            mode: import.mode.as_str().to_string(),
            input: InputStats {
                bytes: import.raw_text.len() as u64,
                detected_format: transcript.detected_format.as_str().to_string(),
                role_warnings: Vec::new(),
            },
            output: OutputStats::default(),
            warnings: transcript.warnings.clone(),
            errors: Vec::new(),
        };
        if let Some(warning) = role_ambiguity(&transcript.messages) {
            diagnostics.input.role_warnings.push(warning);
        }

        self.imports
            .store_normalized(import.id, &serde_json::to_value(&transcript)?)
            .await?;
        self.imports
            .store_diagnostics(import.id, &serde_json::to_value(&diagnostics)?)
            .await?;

        info!(
            import_id = %import.id,
            input_bytes = import.raw_text.len(),
            message_count = transcript.messages.len(),
            format = transcript.detected_format.as_str(),
            "Capture parsed"
        );

        Ok(Self::advanced(job, ImportStep::Parse, |_| {}))
    }

    async fn step_insert_conversations(&self, job: &Job) -> Result<StepOutcome> {
        let import = self.load_import(job).await?;
        let transcript = Self::transcript_of(&import)?;

        let inserted = if transcript.messages.is_empty() {
            // Empty captures reduce to nothing; downstream steps see no
            // rows and complete as no-ops.
            0
        } else {
            self.conversations
                .upsert(NewConversation {
                    import_id: import.id,
                    user_id: import.user_id,
                    source_index: 0,
                    title: import.title.clone(),
                    detected_format: transcript.detected_format.as_str().to_string(),
                })
                .await?;
            1
        };

        Ok(Self::advanced(job, ImportStep::InsertConversations, |p| {
            p.conversations_inserted = inserted;
        }))
    }

    async fn step_insert_messages(&self, job: &Job) -> Result<StepOutcome> {
        let import = self.load_import(job).await?;
        let transcript = Self::transcript_of(&import)?;

        if !transcript.messages.is_empty() {
            let conversation_id = self.conversation_id_of(import.id).await?;
            let batch: Vec<NewMessage> = transcript
                .messages
                .iter()
                .map(|m| NewMessage {
                    conversation_id,
                    position: m.index_in_conversation,
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect();
            self.messages.insert_many(batch).await?;
        }

        let persisted = self.messages.count_for_import(import.id).await?;
        Ok(Self::advanced(job, ImportStep::InsertMessages, |p| {
            p.messages_inserted = persisted;
        }))
    }

    async fn step_chunk_messages(&self, job: &Job) -> Result<StepOutcome> {
        let import = self.load_import(job).await?;

        let mut batch = Vec::new();
        for conversation in self.conversations.list_for_import(import.id).await? {
            for message in self.messages.list_for_conversation(conversation.id).await? {
                for chunk in chunk_text(&message.content) {
                    batch.push(NewChunk {
                        message_id: message.id,
                        conversation_id: conversation.id,
                        chunk_index: chunk.chunk_index as i32,
                        content: chunk.content,
                        start_offset: chunk.start_offset as i32,
                        end_offset: chunk.end_offset as i32,
                    });
                }
            }
        }
        if !batch.is_empty() {
            self.chunks.insert_many(batch).await?;
        }

        let (created, _embedded) = self.chunks.embedding_counts_for_import(import.id).await?;
        Ok(Self::advanced(job, ImportStep::ChunkMessages, |p| {
            p.chunks_created = created;
        }))
    }

    async fn step_embed_chunks(&self, job: &Job) -> Result<StepOutcome> {
        let import = self.load_import(job).await?;
        let pending = self.chunks.list_unembedded_for_import(import.id).await?;
        let batch_size = self.config.embed_batch_size.max(1);

        for batch in pending.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            // Vectors persist per chunk as they arrive; a provider
            // failure mid-batch loses nothing already embedded.
            let vectors = self.embedder.embed_texts(&texts).await?;
            for (chunk, vector) in batch.iter().zip(vectors) {
                self.chunks.store_embedding(chunk.id, &vector).await?;
            }
        }

        let (_created, embedded) = self.chunks.embedding_counts_for_import(import.id).await?;
        if embedded > 0 {
            info!(
                import_id = %import.id,
                chunk_count = embedded,
                model = self.embedder.model_name(),
                "Chunks embedded"
            );
        }
        Ok(Self::advanced(job, ImportStep::EmbedChunks, |p| {
            p.chunks_embedded = embedded;
        }))
    }

    async fn step_finalize(&self, job: &Job) -> Result<StepOutcome> {
        let import = self.load_import(job).await?;
        let transcript = Self::transcript_of(&import)?;

        // Tag extraction is best-effort: a provider outage surfaces as
        // a warning on the outcome, never as a step failure.
        let sample: Vec<String> = transcript.messages.iter().map(|m| m.content.clone()).collect();
        let tags = self.tagger.extract(import.title.as_deref(), &sample).await;
        if let Some(warning) = &tags.warning {
            warn!(import_id = %import.id, warning = %warning, "Tag extraction degraded");
        }
        self.imports
            .store_tags(import.id, &tags.tags, &tags.suggestions)
            .await?;

        let conversations_persisted =
            self.conversations.list_for_import(import.id).await?.len() as i64;
        let messages_persisted = self.messages.count_for_import(import.id).await?;
        let (chunks_created, chunks_embedded) =
            self.chunks.embedding_counts_for_import(import.id).await?;
        let messages_extracted = transcript.messages.len() as i64;

        let mut diagnostics = Self::diagnostics_of(&import);
        diagnostics.output = OutputStats {
            conversations_extracted: if transcript.messages.is_empty() { 0 } else { 1 },
            conversations_persisted,
            messages_extracted,
            messages_persisted,
            chunks_created,
            chunks_embedded,
            dropped: Vec::new(),
        };
        if messages_extracted > messages_persisted {
            diagnostics.output.dropped.push(DropRecord {
                reason: "message_not_persisted".to_string(),
                count: messages_extracted - messages_persisted,
            });
        }
        self.imports
            .store_diagnostics(import.id, &serde_json::to_value(&diagnostics)?)
            .await?;
        self.imports
            .set_status(import.id, ImportStatus::Reduced)
            .await?;

        info!(
            import_id = %import.id,
            message_count = messages_persisted,
            chunk_count = chunks_created,
            tag_count = tags.tags.len(),
            "Capture reduced"
        );

        let mut progress = Self::carry(job);
        progress.percent = ImportStep::Finalize.completion_percent();
        Ok(StepOutcome::Finished {
            step: ImportStep::Finalize.as_str(),
            progress: JobProgress::Import(progress),
        })
    }

    async fn conversation_id_of(&self, import_id: Uuid) -> Result<Uuid> {
        self.conversations
            .list_for_import(import_id)
            .await?
            .first()
            .map(|c| c.id)
            .ok_or_else(|| {
                Error::StepProcessing(format!(
                    "capture {} has no conversation row; insert_conversations must complete first",
                    import_id
                ))
            })
    }
}

#[async_trait]
impl StepHandler for ImportHandler {
    fn job_type(&self) -> JobType {
        JobType::ImportProcessing
    }

    #[instrument(
        skip(self, job),
        fields(subsystem = "jobs", component = "import", job_id = %job.id, job_step = %job.step)
    )]
    async fn run_step(&self, job: &Job) -> Result<StepOutcome> {
        let last = ImportStep::parse(&job.step).ok_or_else(|| {
            Error::Internal(format!("job {} has unknown import step '{}'", job.id, job.step))
        })?;

        let result = match last.next() {
            Some(ImportStep::Parse) => self.step_parse(job).await,
            Some(ImportStep::InsertConversations) => self.step_insert_conversations(job).await,
            Some(ImportStep::InsertMessages) => self.step_insert_messages(job).await,
            Some(ImportStep::ChunkMessages) => self.step_chunk_messages(job).await,
            Some(ImportStep::EmbedChunks) => self.step_embed_chunks(job).await,
            Some(ImportStep::Finalize) => self.step_finalize(job).await,
            // Claimed again after finalize completed but before the job
            // row was marked done; nothing left to run.
            Some(ImportStep::Queued) | None => Ok(StepOutcome::Finished {
                step: ImportStep::Finalize.as_str(),
                progress: JobProgress::Import(Self::carry(job)),
            }),
        };

        // Mirror step failures onto the capture so its status stays
        // honest without consulting the job row.
        if result.is_err() {
            if let Some(import_id) = job.import_id {
                if let Err(e) = self.imports.set_status(import_id, ImportStatus::Failed).await {
                    warn!(import_id = %import_id, error = %e, "Could not mark capture as failed");
                }
            }
        }
        result
    }
}
