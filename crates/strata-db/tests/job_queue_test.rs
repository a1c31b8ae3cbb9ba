//! Integration tests for the persisted job queue.
//!
//! Covers the lock protocol (claim, progress, complete, fail), the
//! manual retry path and the debounced recompute dispatch.
//!
//! **IMPORTANT**: These tests require a fully migrated PostgreSQL
//! database. Run migrations first: `sqlx migrate run`

use strata_core::{
    DispatchOutcome, Error, ImportProgress, JobProgress, JobStatus, JobType, QueueRecomputeJob,
    RecomputeScope,
};
use strata_db::test_fixtures::TestDatabase;
use strata_db::JobRepository;

async fn connect() -> TestDatabase {
    dotenvy::dotenv().ok();
    TestDatabase::new().await
}

// =============================================================================
// Lock protocol
// =============================================================================

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn claim_is_exclusive_under_concurrency() {
    let t = connect().await;
    let (_, job_id) = t.seed_capture("User: race me").await;

    let (a, b) = tokio::join!(t.db.jobs.claim(job_id), t.db.jobs.claim(job_id));
    let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
    assert_eq!(wins, 1);

    t.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn full_lifecycle_queue_claim_progress_complete() {
    let t = connect().await;
    let (_, job_id) = t.seed_capture("User: hello\nAssistant: hi").await;

    let claimable = t.db.jobs.list_claimable(None, 10).await.unwrap();
    assert!(claimable.iter().any(|j| j.id == job_id));

    // The type filter keeps import jobs out of a recompute-only scan.
    let recompute_only = t
        .db
        .jobs
        .list_claimable(Some(JobType::StructureRecompute), 10)
        .await
        .unwrap();
    assert!(!recompute_only.iter().any(|j| j.id == job_id));

    assert!(t.db.jobs.claim(job_id).await.unwrap());

    let progress = JobProgress::Import(ImportProgress {
        conversations_inserted: 1,
        messages_inserted: 2,
        chunks_created: 0,
        chunks_embedded: 0,
        percent: 45,
    });
    t.db
        .jobs
        .record_progress(job_id, "insert_messages", &progress)
        .await
        .unwrap();

    let job = t.db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.step, "insert_messages");
    assert_eq!(job.effective_status(), JobStatus::Running);
    assert_eq!(job.progress, Some(progress));

    t.db.jobs.complete(job_id).await.unwrap();

    let job = t.db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.locked_at.is_none());
    // Done jobs never reappear in the claim scan.
    assert!(!t
        .db
        .jobs
        .list_claimable(None, 100)
        .await
        .unwrap()
        .iter()
        .any(|j| j.id == job_id));

    t.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn progress_without_lock_is_a_stale_lock_error() {
    let t = connect().await;
    let (_, job_id) = t.seed_capture("User: unlocked").await;

    let progress = JobProgress::Import(ImportProgress::default());
    let err = t
        .db
        .jobs
        .record_progress(job_id, "parse", &progress)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleLock(_)));

    t.cleanup().await;
}

// =============================================================================
// Failure and retry
// =============================================================================

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn fail_then_retry_resumes_from_last_step() {
    let t = connect().await;
    let (_, job_id) = t.seed_capture("User: retry me").await;

    t.db.jobs.claim(job_id).await.unwrap();
    t.db
        .jobs
        .record_progress(
            job_id,
            "chunk_messages",
            &JobProgress::Import(ImportProgress::default()),
        )
        .await
        .unwrap();
    t.db.jobs.fail(job_id, "embed provider 503").await.unwrap();

    let job = t.db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.attempt_count, 1);
    assert!(job.locked_at.is_none());
    assert!(job.can_retry());

    let job = t.db.jobs.reset_for_retry(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.step, "chunk_messages");
    assert_eq!(job.attempt_count, 0);
    assert!(job.last_error.is_none());

    // Errored-then-reset jobs are claimable again.
    assert!(t.db.jobs.claim(job_id).await.unwrap());

    t.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn retry_rejects_pending_and_done_jobs() {
    let t = connect().await;
    let (_, job_id) = t.seed_capture("User: nope").await;

    let err = t.db.jobs.reset_for_retry(job_id).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    t.db.jobs.claim(job_id).await.unwrap();
    t.db.jobs.complete(job_id).await.unwrap();
    let err = t.db.jobs.reset_for_retry(job_id).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    t.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn reclaim_stale_sweeps_expired_locks() {
    let t = connect().await;
    let (_, job_id) = t.seed_capture("User: stale").await;
    t.db.jobs.claim(job_id).await.unwrap();

    // Backdate the lock past any reasonable lease.
    sqlx::query("UPDATE jobs SET locked_at = NOW() - INTERVAL '20 minutes' WHERE id = $1")
        .bind(job_id)
        .execute(t.db.pool())
        .await
        .unwrap();

    let swept = t
        .db
        .jobs
        .reclaim_stale(chrono::Duration::seconds(600))
        .await
        .unwrap();
    assert!(swept.contains(&job_id));

    let job = t.db.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.last_error.as_deref(), Some("lock lease expired"));
    assert_eq!(job.attempt_count, 1);

    t.cleanup().await;
}

// =============================================================================
// Debounced recompute dispatch
// =============================================================================

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn recompute_dispatch_collapses_per_user_scope() {
    let t = connect().await;

    let first = t
        .db
        .jobs
        .queue_recompute(QueueRecomputeJob {
            user_id: t.user_id,
            scope: RecomputeScope::Full,
            reason: "import_completed".into(),
        })
        .await
        .unwrap();
    let second = t
        .db
        .jobs
        .queue_recompute(QueueRecomputeJob {
            user_id: t.user_id,
            scope: RecomputeScope::Full,
            reason: "task_updated".into(),
        })
        .await
        .unwrap();

    assert!(matches!(first, DispatchOutcome::Created(_)));
    assert_eq!(second, DispatchOutcome::Merged(first.job_id()));

    let job = t.db.jobs.get(first.job_id()).await.unwrap().unwrap();
    assert_eq!(job.reason.as_deref(), Some("task_updated"));

    // A different scope is a different debounce bucket.
    let windows = t
        .db
        .jobs
        .queue_recompute(QueueRecomputeJob {
            user_id: t.user_id,
            scope: RecomputeScope::Windows,
            reason: "thinking_time_set".into(),
        })
        .await
        .unwrap();
    assert!(matches!(windows, DispatchOutcome::Created(_)));

    t.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn claimed_recompute_jobs_are_not_merge_targets() {
    let t = connect().await;

    let first = t
        .db
        .jobs
        .queue_recompute(QueueRecomputeJob {
            user_id: t.user_id,
            scope: RecomputeScope::Signals,
            reason: "a".into(),
        })
        .await
        .unwrap();
    assert!(t.db.jobs.claim(first.job_id()).await.unwrap());

    let second = t
        .db
        .jobs
        .queue_recompute(QueueRecomputeJob {
            user_id: t.user_id,
            scope: RecomputeScope::Signals,
            reason: "b".into(),
        })
        .await
        .unwrap();

    assert!(matches!(second, DispatchOutcome::Created(_)));
    assert_ne!(second.job_id(), first.job_id());

    t.cleanup().await;
}

// =============================================================================
// Stats and retention
// =============================================================================

#[tokio::test]
#[ignore] // Requires DATABASE_URL with migrated database
async fn queue_stats_distinguish_running_from_pending() {
    let t = connect().await;
    let (_, _pending) = t.seed_capture("User: one").await;
    let (_, running) = t.seed_capture("User: two").await;
    t.db.jobs.claim(running).await.unwrap();

    let stats = t.db.jobs.queue_stats().await.unwrap();
    assert!(stats.pending >= 1);
    assert!(stats.running >= 1);
    assert!(stats.total >= 2);

    t.cleanup().await;
}
