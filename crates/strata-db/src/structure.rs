//! Derived-structure repositories: thinking windows and signals, plus
//! the read-only task/decision views the recompute pipeline scores.
//!
//! Window and signal writes replace a user's rows wholesale inside one
//! transaction, so readers only ever see the output of a single
//! recompute run.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{
    new_v7, DecisionRecord, DecisionRepository, Error, NewStructureSignal, NewThinkingWindow,
    Result, SignalKind, SourceKind, StructureRepository, StructureSignal, TaskRecord,
    TaskRepository, ThinkingWindow,
};

// =============================================================================
// TASKS / DECISIONS (read-only views)
// =============================================================================

/// Read-only access to tasks written by the external CRUD surface.
pub struct PgTaskRepository {
    pool: Pool<Postgres>,
}

impl PgTaskRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_task_row(row: PgRow) -> TaskRecord {
        TaskRecord {
            id: row.get("id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            status: row.get("status"),
            due_at: row.get("due_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn list_open_for_user(&self, user_id: Uuid) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, status, due_at, created_at, updated_at
            FROM tasks
            WHERE user_id = $1 AND status = 'open'
            ORDER BY due_at ASC NULLS LAST, created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_task_row).collect())
    }
}

/// Read-only access to decisions written by the external CRUD surface.
pub struct PgDecisionRepository {
    pool: Pool<Postgres>,
}

impl PgDecisionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_decision_row(row: PgRow) -> DecisionRecord {
        DecisionRecord {
            id: row.get("id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            status: row.get("status"),
            decided_at: row.get("decided_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl DecisionRepository for PgDecisionRepository {
    async fn list_open_for_user(&self, user_id: Uuid) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, status, decided_at, created_at, updated_at
            FROM decisions
            WHERE user_id = $1 AND status = 'open'
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_decision_row).collect())
    }
}

// =============================================================================
// DERIVED STRUCTURE
// =============================================================================

/// PostgreSQL store for recompute output.
pub struct PgStructureRepository {
    pool: Pool<Postgres>,
}

impl PgStructureRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn str_to_signal_kind(s: &str) -> SignalKind {
        match s {
            "priority" => SignalKind::Priority,
            _ => SignalKind::Tension,
        }
    }

    fn str_to_source_kind(s: &str) -> SourceKind {
        match s {
            "decision" => SourceKind::Decision,
            _ => SourceKind::Task,
        }
    }

    fn parse_window_row(row: PgRow) -> ThinkingWindow {
        ThinkingWindow {
            id: row.get("id"),
            user_id: row.get("user_id"),
            conversation_id: row.get("conversation_id"),
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            minutes: row.get("minutes"),
            message_count: row.get("message_count"),
            computed_at: row.get("computed_at"),
        }
    }

    fn parse_signal_row(row: PgRow) -> StructureSignal {
        let kind: String = row.get("kind");
        let source_kind: String = row.get("source_kind");

        StructureSignal {
            id: row.get("id"),
            user_id: row.get("user_id"),
            kind: Self::str_to_signal_kind(&kind),
            source_kind: Self::str_to_source_kind(&source_kind),
            source_id: row.get("source_id"),
            score: row.get("score"),
            reason: row.get("reason"),
            computed_at: row.get("computed_at"),
        }
    }
}

#[async_trait]
impl StructureRepository for PgStructureRepository {
    async fn replace_windows(
        &self,
        user_id: Uuid,
        windows: Vec<NewThinkingWindow>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM thinking_windows WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let mut written = 0i64;
        for window in &windows {
            sqlx::query(
                r#"
                INSERT INTO thinking_windows (id, user_id, conversation_id, started_at,
                                              ended_at, minutes, message_count, computed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(new_v7())
            .bind(window.user_id)
            .bind(window.conversation_id)
            .bind(window.started_at)
            .bind(window.ended_at)
            .bind(window.minutes)
            .bind(window.message_count)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            written += 1;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(written)
    }

    async fn replace_signals(
        &self,
        user_id: Uuid,
        signals: Vec<NewStructureSignal>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM structure_signals WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let mut written = 0i64;
        for signal in &signals {
            sqlx::query(
                r#"
                INSERT INTO structure_signals (id, user_id, kind, source_kind, source_id,
                                               score, reason, computed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(new_v7())
            .bind(signal.user_id)
            .bind(signal.kind.as_str())
            .bind(signal.source_kind.as_str())
            .bind(signal.source_id)
            .bind(signal.score)
            .bind(&signal.reason)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            written += 1;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(written)
    }

    async fn list_windows(&self, user_id: Uuid) -> Result<Vec<ThinkingWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, conversation_id, started_at, ended_at, minutes,
                   message_count, computed_at
            FROM thinking_windows
            WHERE user_id = $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_window_row).collect())
    }

    async fn list_signals(&self, user_id: Uuid) -> Result<Vec<StructureSignal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, source_kind, source_id, score, reason, computed_at
            FROM structure_signals
            WHERE user_id = $1
            ORDER BY score DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_signal_row).collect())
    }
}
