//! Job queue repository.
//!
//! Jobs are claimed with a conditional UPDATE on `locked_at`: the single
//! statement is the whole locking protocol, so exactly one concurrent
//! caller observes a row change and everyone else moves on. The `status`
//! column only ever stores `pending`, `error` or `done`; a pending row
//! with a lock is what the rest of the system calls "running".

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{
    new_v7, DispatchOutcome, Error, Job, JobProgress, JobRepository, JobStatus, JobType,
    QueueImportJob, QueueRecomputeJob, QueueStats, RecomputeScope, Result,
};

/// PostgreSQL implementation of the job queue.
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn job_type_to_str(job_type: JobType) -> &'static str {
        job_type.as_str()
    }

    fn str_to_job_type(s: &str) -> JobType {
        // Unknown types fall back to import processing rather than
        // poisoning every list query that touches the row.
        JobType::parse(s).unwrap_or(JobType::ImportProcessing)
    }

    fn job_status_to_str(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Pending => "pending",
            // Never persisted; the column stores pending + a lock instead.
            JobStatus::Running => "running",
            JobStatus::Error => "error",
            JobStatus::Done => "done",
        }
    }

    fn str_to_job_status(s: &str) -> JobStatus {
        match s {
            "error" => JobStatus::Error,
            "done" => JobStatus::Done,
            _ => JobStatus::Pending,
        }
    }

    fn parse_job_row(row: PgRow) -> Job {
        let job_type: String = row.get("job_type");
        let status: String = row.get("status");
        let progress: Option<JsonValue> = row.get("progress");
        let scope: Option<String> = row.get("scope");

        Job {
            id: row.get("id"),
            job_type: Self::str_to_job_type(&job_type),
            step: row.get("step"),
            status: Self::str_to_job_status(&status),
            progress: progress.and_then(|v| serde_json::from_value::<JobProgress>(v).ok()),
            last_error: row.get("last_error"),
            locked_at: row.get("locked_at"),
            attempt_count: row.get("attempt_count"),
            user_id: row.get("user_id"),
            import_id: row.get("import_id"),
            scope: scope.and_then(|s| RecomputeScope::parse(&s)),
            reason: row.get("reason"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn queue_import(&self, req: QueueImportJob) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, step, status, user_id, import_id, created_at, updated_at)
            VALUES ($1, 'import_processing', 'queued', 'pending', $2, $3, $4, $4)
            "#,
        )
        .bind(id)
        .bind(req.user_id)
        .bind(req.import_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn queue_recompute(&self, req: QueueRecomputeJob) -> Result<DispatchOutcome> {
        let now = Utc::now();
        let scope = req.scope.as_str();

        // Merge into an unclaimed pending job for the same (user, scope)
        // first. Overwriting reason and updated_at is the debounce
        // contract: the newest dispatch describes the pending work.
        let merged: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET reason = $3, updated_at = $4
            WHERE job_type = 'structure_recompute'
              AND user_id = $1
              AND scope = $2
              AND status = 'pending'
              AND locked_at IS NULL
            RETURNING id
            "#,
        )
        .bind(req.user_id)
        .bind(scope)
        .bind(&req.reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(id) = merged {
            return Ok(DispatchOutcome::Merged(id));
        }

        // No mergeable row: insert, with the partial unique index as the
        // arbiter so two concurrent dispatchers cannot both insert.
        let id = new_v7();
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (id, job_type, step, status, user_id, scope, reason, created_at, updated_at)
            VALUES ($1, 'structure_recompute', 'queued', 'pending', $2, $3, $4, $5, $5)
            ON CONFLICT (user_id, scope)
                WHERE job_type = 'structure_recompute'
                  AND status = 'pending'
                  AND locked_at IS NULL
                DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(req.user_id)
        .bind(scope)
        .bind(&req.reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(id) = inserted {
            return Ok(DispatchOutcome::Created(id));
        }

        // Lost the insert race; the winner's row is mergeable now.
        let merged: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET reason = $3, updated_at = $4
            WHERE job_type = 'structure_recompute'
              AND user_id = $1
              AND scope = $2
              AND status = 'pending'
              AND locked_at IS NULL
            RETURNING id
            "#,
        )
        .bind(req.user_id)
        .bind(scope)
        .bind(&req.reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match merged {
            Some(id) => Ok(DispatchOutcome::Merged(id)),
            // The racing job was claimed between our insert and merge.
            None => Err(Error::ClaimConflict(format!(
                "recompute dispatch for user {} scope {} raced a claim",
                req.user_id, scope
            ))),
        }
    }

    async fn list_claimable(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, step, status, progress, last_error, locked_at,
                   attempt_count, user_id, import_id, scope, reason, created_at, updated_at
            FROM jobs
            WHERE status = 'pending' AND locked_at IS NULL
              AND ($1::text IS NULL OR job_type = $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(job_type.map(Self::job_type_to_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn claim(&self, job_id: Uuid) -> Result<bool> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending' AND locked_at IS NULL
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        step: &str,
        progress: &JobProgress,
    ) -> Result<()> {
        let now = Utc::now();
        let progress_json = serde_json::to_value(progress)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET step = $2, progress = $3, updated_at = $4
            WHERE id = $1 AND status = 'pending' AND locked_at IS NOT NULL
            "#,
        )
        .bind(job_id)
        .bind(step)
        .bind(progress_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::StaleLock(format!(
                "job {} is no longer held; progress for step '{}' dropped",
                job_id, step
            )));
        }

        Ok(())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', locked_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'pending' AND locked_at IS NOT NULL
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::StaleLock(format!(
                "job {} is no longer held; completion dropped",
                job_id
            )));
        }

        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'error', last_error = $2, attempt_count = attempt_count + 1,
                locked_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            // Terminal rows stay as they are: the stale-lock sweep may
            // have failed the job before the handler reported in.
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;

            if !exists {
                return Err(Error::JobNotFound(job_id));
            }
        }

        Ok(())
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Job> {
        let now = Utc::now();

        // `step` is deliberately untouched: the retried job resumes from
        // its last completed step, not from the beginning.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', last_error = NULL, locked_at = NULL,
                attempt_count = 0, updated_at = $2
            WHERE id = $1 AND status = 'error'
            RETURNING id, job_type, step, status, progress, last_error, locked_at,
                      attempt_count, user_id, import_id, scope, reason, created_at, updated_at
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Ok(Self::parse_job_row(row)),
            None => match self.get(job_id).await? {
                Some(job) => Err(Error::Validation(format!(
                    "job {} has status '{}'; only errored jobs can be retried",
                    job_id,
                    Self::job_status_to_str(job.effective_status())
                ))),
                None => Err(Error::JobNotFound(job_id)),
            },
        }
    }

    async fn reclaim_stale(&self, lease: chrono::Duration) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let cutoff = now - lease;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'error', last_error = 'lock lease expired',
                attempt_count = attempt_count + 1, locked_at = NULL, updated_at = $2
            WHERE status = 'pending' AND locked_at IS NOT NULL AND locked_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ids)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT id, job_type, step, status, progress, last_error, locked_at,
                   attempt_count, user_id, import_id, scope, reason, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }

    async fn list_recent_for_user(
        &self,
        user_id: Uuid,
        job_type: Option<JobType>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, step, status, progress, last_error, locked_at,
                   attempt_count, user_id, import_id, scope, reason, created_at, updated_at
            FROM jobs
            WHERE user_id = $1
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(job_type.map(Self::job_type_to_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND locked_at IS NULL) AS pending,
                COUNT(*) FILTER (WHERE status = 'pending' AND locked_at IS NOT NULL) AS running,
                COUNT(*) FILTER (WHERE status = 'error') AS error,
                COUNT(*) FILTER (WHERE status = 'done'
                                   AND updated_at > NOW() - INTERVAL '1 hour') AS done_last_hour,
                COUNT(*) AS total
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            error: row.get("error"),
            done_last_hour: row.get("done_last_hour"),
            total: row.get("total"),
        })
    }

    async fn cleanup(&self, keep_days: i32) -> Result<i64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('done', 'error')
              AND updated_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(keep_days)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() as i64)
    }
}
