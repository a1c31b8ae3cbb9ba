//! Conversation repository.
//!
//! The upsert on (import_id, source_index) is what makes the
//! insert-conversations pipeline step safe to repeat: a resumed job
//! lands on the existing rows instead of duplicating them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{
    new_v7, Conversation, ConversationRepository, Error, NewConversation, Result,
};

/// PostgreSQL implementation of the conversation store.
pub struct PgConversationRepository {
    pool: Pool<Postgres>,
}

impl PgConversationRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_conversation_row(row: PgRow) -> Conversation {
        Conversation {
            id: row.get("id"),
            import_id: row.get("import_id"),
            user_id: row.get("user_id"),
            source_index: row.get("source_index"),
            title: row.get("title"),
            detected_format: row.get("detected_format"),
            thinking_started_at: row.get("thinking_started_at"),
            thinking_ended_at: row.get("thinking_ended_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn upsert(&self, conv: NewConversation) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();

        // The conflict target is the (import, source_index) pair; on a
        // repeat insert the original row wins and only updated_at moves.
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO conversations (id, import_id, user_id, source_index, title,
                                       detected_format, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (import_id, source_index)
                DO UPDATE SET updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(conv.import_id)
        .bind(conv.user_id)
        .bind(conv.source_index)
        .bind(&conv.title)
        .bind(&conv.detected_format)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn list_for_import(&self, import_id: Uuid) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, import_id, user_id, source_index, title, detected_format,
                   thinking_started_at, thinking_ended_at, created_at, updated_at
            FROM conversations
            WHERE import_id = $1
            ORDER BY source_index ASC
            "#,
        )
        .bind(import_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_conversation_row).collect())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, import_id, user_id, source_index, title, detected_format,
                   thinking_started_at, thinking_ended_at, created_at, updated_at
            FROM conversations
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_conversation_row).collect())
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

        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET thinking_started_at = $2, thinking_ended_at = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(started_at)
        .bind(ended_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("conversation {}", id)));
        }

        Ok(())
    }
}
