//! End-to-end pipeline tests over the in-memory repositories.
//!
//! These cover the processor/handler contract without PostgreSQL:
//! batch accounting, resume after failure, claim exclusivity, debounced
//! dispatch and the recompute derivations. The PostgreSQL-backed queue
//! semantics live in the strata-db integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use strata_core::{
    new_v7, CaptureMode, ChunkRepository, ConversationRepository, CreateImport, DecisionRecord,
    DispatchOutcome, Error, ImportRecord, ImportRepository, ImportStatus, Job, JobProgress,
    JobRepository, JobStatus, JobType, MessageRepository, MessageRole, NewConversation,
    QueueImportJob, QueueRecomputeJob, QueueStats, RecomputeScope, ReductionDiagnostics, Result,
    SignalKind, StructureRepository, TaskRecord,
};
use strata_db::memory::MemoryStore;
use strata_db::compute_content_hash;
use strata_inference::mock::{MockEmbeddingBackend, MockTagExtractor};
use strata_jobs::handler::{NoOpHandler, StepHandler};
use strata_jobs::import::{ImportConfig, ImportHandler};
use strata_jobs::processor::{ProcessorConfig, QueueProcessor};
use strata_jobs::recompute::{RecomputeDispatcher, RecomputeHandler};

fn import_handler(
    db: &MemoryStore,
    embedder: &MockEmbeddingBackend,
    tagger: &MockTagExtractor,
) -> ImportHandler {
    ImportHandler::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(embedder.clone()),
        Arc::new(tagger.clone()),
    )
}

fn recompute_handler(db: &MemoryStore) -> RecomputeHandler {
    RecomputeHandler::new(
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
    )
}

async fn seed_capture(db: &MemoryStore, user_id: Uuid, raw_text: &str) -> (Uuid, Uuid) {
    let import_id = db
        .create(CreateImport {
            user_id,
            mode: CaptureMode::Standard,
            title: None,
            raw_text: raw_text.to_string(),
            content_hash: compute_content_hash(raw_text),
        })
        .await
        .unwrap();
    let job_id = db
        .queue_import(QueueImportJob { user_id, import_id })
        .await
        .unwrap();
    (import_id, job_id)
}

async fn job(db: &MemoryStore, id: Uuid) -> Job {
    JobRepository::get(db, id).await.unwrap().expect("job exists")
}

async fn import(db: &MemoryStore, id: Uuid) -> ImportRecord {
    ImportRepository::get(db, id)
        .await
        .unwrap()
        .expect("import exists")
}

#[tokio::test]
async fn import_pipeline_reduces_a_capture_end_to_end() {
    let db = MemoryStore::new();
    let user_id = new_v7();
    let (import_id, job_id) = seed_capture(
        &db,
        user_id,
        "User: What is Rust?\nAssistant: A systems programming language.",
    )
    .await;

    let embedder = MockEmbeddingBackend::new(8);
    let tagger = MockTagExtractor::with_tags(vec!["rust", "languages"]);
    let processor = QueueProcessor::new(Arc::new(db.clone()))
        .with_handler(import_handler(&db, &embedder, &tagger));

    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.succeeded, vec![job_id]);
    assert!(outcome.failed.is_empty());

    let job = job(&db, job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.step, "finalize");
    assert_eq!(job.progress.as_ref().unwrap().percent(), 100);
    match job.progress.unwrap() {
        JobProgress::Import(p) => {
            assert_eq!(p.conversations_inserted, 1);
            assert_eq!(p.messages_inserted, 2);
            assert_eq!(p.chunks_created, 2);
            assert_eq!(p.chunks_embedded, 2);
        }
        other => panic!("unexpected progress shape: {:?}", other),
    }

    let import = import(&db, import_id).await;
    assert_eq!(import.status, ImportStatus::Reduced);
    assert!(import.normalized.is_some());
    assert_eq!(import.tags, vec!["rust", "languages"]);

    let diagnostics: ReductionDiagnostics =
        serde_json::from_value(import.diagnostics.unwrap()).unwrap();
    assert_eq!(diagnostics.input.detected_format, "chat_roles");
    assert_eq!(diagnostics.output.messages_extracted, 2);
    assert_eq!(diagnostics.output.messages_persisted, 2);
    assert_eq!(diagnostics.output.chunks_embedded, 2);
    assert!(diagnostics.output.dropped.is_empty());

    let conversations = db.list_for_import(import_id).await.unwrap();
    assert_eq!(conversations.len(), 1);
    let messages = db.list_for_conversation(conversations[0].id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);

    assert_eq!(db.embedded_chunk_count(), 2);
    assert_eq!(embedder.call_count(), 1);
    assert_eq!(tagger.call_count(), 1);
}

#[tokio::test]
async fn empty_capture_reduces_to_zero_artifacts() {
    let db = MemoryStore::new();
    let (import_id, job_id) = seed_capture(&db, new_v7(), "   \n\t \n ").await;

    let embedder = MockEmbeddingBackend::new(8);
    let processor = QueueProcessor::new(Arc::new(db.clone())).with_handler(import_handler(
        &db,
        &embedder,
        &MockTagExtractor::with_tags(vec![]),
    ));
    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 1);

    let job = job(&db, job_id).await;
    assert_eq!(job.status, JobStatus::Done);

    let import = import(&db, import_id).await;
    assert_eq!(import.status, ImportStatus::Reduced);
    let diagnostics: ReductionDiagnostics =
        serde_json::from_value(import.diagnostics.unwrap()).unwrap();
    assert!(diagnostics.warnings.contains(&"empty_input".to_string()));
    assert_eq!(diagnostics.output.conversations_persisted, 0);
    assert_eq!(diagnostics.output.messages_persisted, 0);

    assert!(db.list_for_import(import_id).await.unwrap().is_empty());
    assert_eq!(db.embedded_chunk_count(), 0);
    assert_eq!(embedder.call_count(), 0);
}

#[tokio::test]
async fn tag_outage_never_fails_the_pipeline() {
    let db = MemoryStore::new();
    let (import_id, job_id) = seed_capture(&db, new_v7(), "User: hello\nAssistant: hi").await;

    let processor = QueueProcessor::new(Arc::new(db.clone())).with_handler(import_handler(
        &db,
        &MockEmbeddingBackend::new(8),
        &MockTagExtractor::failing("tag model offline"),
    ));
    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 1);

    assert_eq!(job(&db, job_id).await.status, JobStatus::Done);
    let import = import(&db, import_id).await;
    assert_eq!(import.status, ImportStatus::Reduced);
    assert!(import.tags.is_empty());
}

#[tokio::test]
async fn batch_accounting_partitions_succeeded_and_failed() {
    let db = MemoryStore::new();
    let user_id = new_v7();
    let (_, job_a) = seed_capture(&db, user_id, "User: a\nAssistant: b").await;
    let (_, job_b) = seed_capture(&db, user_id, "User: c\nAssistant: d").await;
    let (import_c, job_c) = seed_capture(&db, user_id, "User: e\nAssistant: f").await;

    // One embed call per capture; the third call fails.
    let embedder = MockEmbeddingBackend::new(8).failing_after(2);
    let processor = QueueProcessor::new(Arc::new(db.clone())).with_handler(import_handler(
        &db,
        &embedder,
        &MockTagExtractor::with_tags(vec!["t"]),
    ));

    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.job_ids, vec![job_a, job_b, job_c]);
    assert_eq!(outcome.succeeded, vec![job_a, job_b]);
    assert_eq!(outcome.failed, vec![job_c]);

    for id in [job_a, job_b] {
        assert_eq!(job(&db, id).await.status, JobStatus::Done);
    }
    let failed = job(&db, job_c).await;
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.step, "chunk_messages");
    assert_eq!(failed.attempt_count, 1);
    assert!(failed.last_error.as_ref().unwrap().contains("injected failure"));
    assert!(failed.can_retry());

    assert_eq!(import(&db, import_c).await.status, ImportStatus::Failed);
}

#[tokio::test]
async fn handler_runs_exactly_one_step_per_invocation() {
    let db = MemoryStore::new();
    let (import_id, job_id) = seed_capture(&db, new_v7(), "User: one\nAssistant: two").await;
    let handler = import_handler(
        &db,
        &MockEmbeddingBackend::new(8),
        &MockTagExtractor::with_tags(vec![]),
    );

    let mut job = job(&db, job_id).await;
    let outcome = handler.run_step(&job).await.unwrap();
    assert_eq!(outcome.step(), "parse");

    // Parse ran; nothing further did.
    assert!(import(&db, import_id).await.normalized.is_some());
    assert!(db.list_for_import(import_id).await.unwrap().is_empty());

    job.step = outcome.step().to_string();
    let outcome = handler.run_step(&job).await.unwrap();
    assert_eq!(outcome.step(), "insert_conversations");
    assert_eq!(db.list_for_import(import_id).await.unwrap().len(), 1);
    assert_eq!(db.count_for_import(import_id).await.unwrap(), 0);
}

#[tokio::test]
async fn insert_and_chunk_steps_are_idempotent_when_rerun() {
    let db = MemoryStore::new();
    let (import_id, job_id) = seed_capture(&db, new_v7(), "User: one\nAssistant: two").await;
    let handler = import_handler(
        &db,
        &MockEmbeddingBackend::new(8),
        &MockTagExtractor::with_tags(vec![]),
    );

    let mut job = job(&db, job_id).await;
    let outcome = handler.run_step(&job).await.unwrap();
    job.step = outcome.step().to_string();

    // A crash between the step and its progress write makes the
    // processor rerun the same step; artifact counts must not change.
    handler.run_step(&job).await.unwrap();
    handler.run_step(&job).await.unwrap();
    assert_eq!(db.list_for_import(import_id).await.unwrap().len(), 1);

    job.step = "insert_conversations".to_string();
    handler.run_step(&job).await.unwrap();
    handler.run_step(&job).await.unwrap();
    assert_eq!(db.count_for_import(import_id).await.unwrap(), 2);

    job.step = "insert_messages".to_string();
    handler.run_step(&job).await.unwrap();
    handler.run_step(&job).await.unwrap();
    let (created, _) = db.embedding_counts_for_import(import_id).await.unwrap();
    assert_eq!(created, 2);
}

#[tokio::test]
async fn embed_failure_keeps_prior_batches_and_retry_resumes() {
    let db = MemoryStore::new();
    let user_id = new_v7();
    let raw = "User: a\nAssistant: b\nUser: c\nAssistant: d\nUser: e";
    let (import_id, job_id) = seed_capture(&db, user_id, raw).await;

    // Five chunks in batches of two; the second embed call fails.
    let embedder = MockEmbeddingBackend::new(8).failing_after(1);
    let handler = import_handler(&db, &embedder, &MockTagExtractor::with_tags(vec![]))
        .with_config(ImportConfig::default().with_embed_batch_size(2));
    let processor = QueueProcessor::new(Arc::new(db.clone())).with_handler(handler);

    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.failed, vec![job_id]);

    let failed = job(&db, job_id).await;
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.step, "chunk_messages");
    // The first batch's vectors survived the failure.
    assert_eq!(db.embedded_chunk_count(), 2);
    assert_eq!(import(&db, import_id).await.status, ImportStatus::Failed);

    let resumed = db.reset_for_retry(job_id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);
    assert_eq!(resumed.step, "chunk_messages");

    // A healthy provider finishes the job from where it stopped.
    let fresh = MockEmbeddingBackend::new(8);
    let processor = QueueProcessor::new(Arc::new(db.clone())).with_handler(import_handler(
        &db,
        &fresh,
        &MockTagExtractor::with_tags(vec![]),
    ));
    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.succeeded, vec![job_id]);

    assert_eq!(job(&db, job_id).await.status, JobStatus::Done);
    assert_eq!(import(&db, import_id).await.status, ImportStatus::Reduced);
    assert_eq!(db.embedded_chunk_count(), 5);
    // Only the three outstanding chunks were re-sent.
    assert_eq!(fresh.embedded_texts().len(), 3);
    // No duplicated artifacts from the resumed steps.
    let conversations = db.list_for_import(import_id).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(db.count_for_import(import_id).await.unwrap(), 5);
}

#[tokio::test]
async fn concurrent_processors_partition_the_queue() {
    let db = MemoryStore::new();
    let mut job_ids = Vec::new();
    for _ in 0..4 {
        let id = db
            .queue_import(QueueImportJob {
                user_id: new_v7(),
                import_id: new_v7(),
            })
            .await
            .unwrap();
        job_ids.push(id);
    }

    let first = QueueProcessor::new(Arc::new(db.clone()))
        .with_handler(NoOpHandler::new(JobType::ImportProcessing));
    let second = QueueProcessor::new(Arc::new(db.clone()))
        .with_handler(NoOpHandler::new(JobType::ImportProcessing));

    let (a, b) = tokio::join!(first.process_queue(None), second.process_queue(None));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.processed + b.processed, 4);
    assert_eq!(a.succeeded.len() + b.succeeded.len(), 4);
    assert!(a.failed.is_empty() && b.failed.is_empty());
    for id in job_ids {
        assert_eq!(job(&db, id).await.status, JobStatus::Done);
    }
}

/// Job repository whose claims are always lost, as when a concurrent
/// processor wins every race.
struct LostClaimJobs {
    job: Job,
}

#[async_trait]
impl JobRepository for LostClaimJobs {
    async fn queue_import(&self, _req: QueueImportJob) -> Result<Uuid> {
        unimplemented!()
    }
    async fn queue_recompute(&self, _req: QueueRecomputeJob) -> Result<DispatchOutcome> {
        unimplemented!()
    }
    async fn list_claimable(&self, _job_type: Option<JobType>, _limit: i64) -> Result<Vec<Job>> {
        Ok(vec![self.job.clone()])
    }
    async fn claim(&self, _job_id: Uuid) -> Result<bool> {
        Ok(false)
    }
    async fn record_progress(
        &self,
        _job_id: Uuid,
        _step: &str,
        _progress: &JobProgress,
    ) -> Result<()> {
        unimplemented!()
    }
    async fn complete(&self, _job_id: Uuid) -> Result<()> {
        unimplemented!()
    }
    async fn fail(&self, _job_id: Uuid, _error: &str) -> Result<()> {
        unimplemented!()
    }
    async fn reset_for_retry(&self, _job_id: Uuid) -> Result<Job> {
        unimplemented!()
    }
    async fn reclaim_stale(&self, _lease: Duration) -> Result<Vec<Uuid>> {
        Ok(Vec::new())
    }
    async fn get(&self, _job_id: Uuid) -> Result<Option<Job>> {
        unimplemented!()
    }
    async fn list_recent_for_user(
        &self,
        _user_id: Uuid,
        _job_type: Option<JobType>,
        _limit: i64,
    ) -> Result<Vec<Job>> {
        unimplemented!()
    }
    async fn queue_stats(&self) -> Result<QueueStats> {
        unimplemented!()
    }
    async fn cleanup(&self, _keep_days: i32) -> Result<i64> {
        unimplemented!()
    }
}

fn pending_import_job() -> Job {
    let now = Utc::now();
    Job {
        id: new_v7(),
        job_type: JobType::ImportProcessing,
        step: "queued".to_string(),
        status: JobStatus::Pending,
        progress: None,
        last_error: None,
        locked_at: None,
        attempt_count: 0,
        user_id: new_v7(),
        import_id: Some(new_v7()),
        scope: None,
        reason: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn lost_claims_are_skipped_and_not_counted() {
    let jobs = Arc::new(LostClaimJobs {
        job: pending_import_job(),
    });
    let processor =
        QueueProcessor::new(jobs).with_handler(NoOpHandler::new(JobType::ImportProcessing));

    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.processed, 0);
    assert!(outcome.job_ids.is_empty());
    assert!(outcome.succeeded.is_empty() && outcome.failed.is_empty());
}

#[tokio::test]
async fn stale_locks_are_swept_before_processing() {
    let db = MemoryStore::new();
    let (_, job_id) = seed_capture(&db, new_v7(), "User: a\nAssistant: b").await;
    assert!(db.claim(job_id).await.unwrap());

    // Zero lease: any held lock is already expired.
    let processor = QueueProcessor::new(Arc::new(db.clone()))
        .with_config(ProcessorConfig::default().with_lock_lease_secs(0))
        .with_handler(import_handler(
            &db,
            &MockEmbeddingBackend::new(8),
            &MockTagExtractor::with_tags(vec![]),
        ));

    let outcome = processor.process_queue(None).await.unwrap();
    // The sweep failed the job; nothing was claimable this batch.
    assert_eq!(outcome.processed, 0);
    let swept = job(&db, job_id).await;
    assert_eq!(swept.status, JobStatus::Error);
    assert!(swept.last_error.as_ref().unwrap().contains("lock lease expired"));
    assert!(swept.can_retry());

    // After a retry the job processes normally under the default lease.
    db.reset_for_retry(job_id).await.unwrap();
    let processor = QueueProcessor::new(Arc::new(db.clone())).with_handler(import_handler(
        &db,
        &MockEmbeddingBackend::new(8),
        &MockTagExtractor::with_tags(vec![]),
    ));
    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.succeeded, vec![job_id]);
    assert_eq!(job(&db, job_id).await.status, JobStatus::Done);
}

#[tokio::test]
async fn recompute_dispatch_debounces_per_user_and_scope() {
    let db = MemoryStore::new();
    let user_id = new_v7();
    let dispatcher = RecomputeDispatcher::new(Arc::new(db.clone()));

    let first = dispatcher
        .dispatch(user_id, RecomputeScope::Full, "task_created")
        .await
        .expect("dispatch recorded");
    assert!(matches!(first, DispatchOutcome::Created(_)));

    let second = dispatcher
        .dispatch(user_id, RecomputeScope::Full, "decision_created")
        .await
        .expect("dispatch recorded");
    assert!(matches!(second, DispatchOutcome::Merged(_)));
    assert_eq!(second.job_id(), first.job_id());
    assert_eq!(
        job(&db, first.job_id()).await.reason.as_deref(),
        Some("decision_created")
    );

    // A different scope never merges.
    let windows = dispatcher
        .dispatch(user_id, RecomputeScope::Windows, "thinking_time_resolved")
        .await
        .expect("dispatch recorded");
    assert!(matches!(windows, DispatchOutcome::Created(_)));
    assert_ne!(windows.job_id(), first.job_id());

    // A claimed job no longer absorbs dispatches.
    assert!(db.claim(first.job_id()).await.unwrap());
    let after_claim = dispatcher
        .dispatch(user_id, RecomputeScope::Full, "task_updated")
        .await
        .expect("dispatch recorded");
    assert!(matches!(after_claim, DispatchOutcome::Created(_)));
    assert_ne!(after_claim.job_id(), first.job_id());
}

/// Job repository that rejects every recompute dispatch.
struct FailingDispatchJobs;

#[async_trait]
impl JobRepository for FailingDispatchJobs {
    async fn queue_import(&self, _req: QueueImportJob) -> Result<Uuid> {
        unimplemented!()
    }
    async fn queue_recompute(&self, _req: QueueRecomputeJob) -> Result<DispatchOutcome> {
        Err(Error::Internal("injected dispatch failure".to_string()))
    }
    async fn list_claimable(&self, _job_type: Option<JobType>, _limit: i64) -> Result<Vec<Job>> {
        unimplemented!()
    }
    async fn claim(&self, _job_id: Uuid) -> Result<bool> {
        unimplemented!()
    }
    async fn record_progress(
        &self,
        _job_id: Uuid,
        _step: &str,
        _progress: &JobProgress,
    ) -> Result<()> {
        unimplemented!()
    }
    async fn complete(&self, _job_id: Uuid) -> Result<()> {
        unimplemented!()
    }
    async fn fail(&self, _job_id: Uuid, _error: &str) -> Result<()> {
        unimplemented!()
    }
    async fn reset_for_retry(&self, _job_id: Uuid) -> Result<Job> {
        unimplemented!()
    }
    async fn reclaim_stale(&self, _lease: Duration) -> Result<Vec<Uuid>> {
        unimplemented!()
    }
    async fn get(&self, _job_id: Uuid) -> Result<Option<Job>> {
        unimplemented!()
    }
    async fn list_recent_for_user(
        &self,
        _user_id: Uuid,
        _job_type: Option<JobType>,
        _limit: i64,
    ) -> Result<Vec<Job>> {
        unimplemented!()
    }
    async fn queue_stats(&self) -> Result<QueueStats> {
        unimplemented!()
    }
    async fn cleanup(&self, _keep_days: i32) -> Result<i64> {
        unimplemented!()
    }
}

#[tokio::test]
async fn dispatch_failures_are_swallowed() {
    let dispatcher = RecomputeDispatcher::new(Arc::new(FailingDispatchJobs));
    let outcome = dispatcher
        .dispatch(new_v7(), RecomputeScope::Full, "task_created")
        .await;
    assert!(outcome.is_none());
}

#[tokio::test]
async fn recompute_builds_windows_and_signals() {
    let db = MemoryStore::new();
    let user_id = new_v7();
    let now = Utc::now();

    // A conversation with resolved thinking time.
    let conversation_id = db
        .upsert(NewConversation {
            import_id: new_v7(),
            user_id,
            source_index: 0,
            title: Some("Planning".to_string()),
            detected_format: "chat_roles".to_string(),
        })
        .await
        .unwrap();
    db.set_thinking_time(
        conversation_id,
        now - Duration::minutes(60),
        now - Duration::minutes(15),
    )
    .await
    .unwrap();

    // One task due within the horizon, one stale open decision.
    db.insert_task(TaskRecord {
        id: new_v7(),
        user_id,
        title: "Ship the release".to_string(),
        status: "open".to_string(),
        due_at: Some(now + Duration::hours(24)),
        created_at: now,
        updated_at: now,
    });
    db.insert_decision(DecisionRecord {
        id: new_v7(),
        user_id,
        title: "Pick the vector store".to_string(),
        status: "open".to_string(),
        decided_at: None,
        created_at: now - Duration::days(14),
        updated_at: now,
    });

    let dispatcher = RecomputeDispatcher::new(Arc::new(db.clone()));
    let dispatched = dispatcher
        .dispatch(user_id, RecomputeScope::Full, "task_created")
        .await
        .expect("dispatch recorded");

    let processor =
        QueueProcessor::new(Arc::new(db.clone())).with_handler(recompute_handler(&db));
    let outcome = processor.process_queue(None).await.unwrap();
    assert_eq!(outcome.succeeded, vec![dispatched.job_id()]);

    let done = job(&db, dispatched.job_id()).await;
    assert_eq!(done.status, JobStatus::Done);
    match done.progress.unwrap() {
        JobProgress::Recompute(p) => {
            assert_eq!(p.windows_built, 1);
            assert_eq!(p.signals_scored, 2);
            assert_eq!(p.percent, 100);
        }
        other => panic!("unexpected progress shape: {:?}", other),
    }

    let windows = db.list_windows(user_id).await.unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].conversation_id, conversation_id);
    assert_eq!(windows[0].minutes, 45);

    // Signals come back highest score first: the due-soon task
    // (~1 - 24/72) ahead of the 14-day decision (~7/21).
    let signals = db.list_signals(user_id).await.unwrap();
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].kind, SignalKind::Priority);
    assert!((signals[0].score - 2.0 / 3.0).abs() < 0.01);
    assert_eq!(signals[1].kind, SignalKind::Tension);
    assert!((signals[1].score - 1.0 / 3.0).abs() < 0.01);
}

#[tokio::test]
async fn recompute_scope_limits_what_is_replaced() {
    let db = MemoryStore::new();
    let user_id = new_v7();
    let now = Utc::now();

    let conversation_id = db
        .upsert(NewConversation {
            import_id: new_v7(),
            user_id,
            source_index: 0,
            title: None,
            detected_format: "plain".to_string(),
        })
        .await
        .unwrap();
    db.set_thinking_time(
        conversation_id,
        now - Duration::minutes(30),
        now - Duration::minutes(10),
    )
    .await
    .unwrap();
    db.insert_task(TaskRecord {
        id: new_v7(),
        user_id,
        title: "Write the migration".to_string(),
        status: "open".to_string(),
        due_at: Some(now + Duration::hours(12)),
        created_at: now,
        updated_at: now,
    });

    let dispatcher = RecomputeDispatcher::new(Arc::new(db.clone()));
    let processor =
        QueueProcessor::new(Arc::new(db.clone())).with_handler(recompute_handler(&db));

    dispatcher
        .dispatch(user_id, RecomputeScope::Full, "seed")
        .await
        .expect("dispatch recorded");
    processor.process_queue(None).await.unwrap();

    let window_id = db.list_windows(user_id).await.unwrap()[0].id;
    assert_eq!(db.list_signals(user_id).await.unwrap().len(), 1);

    // A signals-only run rescores without touching windows.
    db.insert_task(TaskRecord {
        id: new_v7(),
        user_id,
        title: "Fix the flaky test".to_string(),
        status: "open".to_string(),
        due_at: Some(now + Duration::hours(2)),
        created_at: now,
        updated_at: now,
    });
    let signals_job = dispatcher
        .dispatch(user_id, RecomputeScope::Signals, "task_created")
        .await
        .expect("dispatch recorded");
    processor.process_queue(None).await.unwrap();

    assert_eq!(db.list_signals(user_id).await.unwrap().len(), 2);
    let windows = db.list_windows(user_id).await.unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].id, window_id);

    match job(&db, signals_job.job_id()).await.progress.unwrap() {
        JobProgress::Recompute(p) => {
            assert_eq!(p.windows_built, 0);
            assert_eq!(p.signals_scored, 2);
        }
        other => panic!("unexpected progress shape: {:?}", other),
    }

    // A windows-only run leaves signals alone.
    let signal_id = db.list_signals(user_id).await.unwrap()[0].id;
    dispatcher
        .dispatch(user_id, RecomputeScope::Windows, "thinking_time_resolved")
        .await
        .expect("dispatch recorded");
    processor.process_queue(None).await.unwrap();

    assert_eq!(db.list_signals(user_id).await.unwrap()[0].id, signal_id);
    assert_ne!(db.list_windows(user_id).await.unwrap()[0].id, window_id);
}
