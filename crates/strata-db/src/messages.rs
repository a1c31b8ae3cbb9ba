//! Message repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{
    new_v7, ConversationMessage, Error, MessageRepository, MessageRole, NewMessage, Result,
};

/// PostgreSQL implementation of the message store.
pub struct PgMessageRepository {
    pool: Pool<Postgres>,
}

impl PgMessageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_message_row(row: PgRow) -> ConversationMessage {
        let role: String = row.get("role");

        ConversationMessage {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            position: row.get("position"),
            role: MessageRole::parse(&role).unwrap_or(MessageRole::User),
            content: row.get("content"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn insert_many(&self, messages: Vec<NewMessage>) -> Result<i64> {
        if messages.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut inserted = 0i64;

        // Per-row conflict handling keeps a resumed insert-messages step
        // idempotent: rows written before a crash are skipped, the rest
        // land normally.
        for message in &messages {
            let result = sqlx::query(
                r#"
                INSERT INTO conversation_messages (id, conversation_id, position, role,
                                                   content, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (conversation_id, position) DO NOTHING
                "#,
            )
            .bind(new_v7())
            .bind(message.conversation_id)
            .bind(message.position)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            inserted += result.rows_affected() as i64;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(inserted)
    }

    async fn list_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, position, role, content, created_at
            FROM conversation_messages
            WHERE conversation_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_message_row).collect())
    }

    async fn count_for_import(&self, import_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM conversation_messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.import_id = $1
            "#,
        )
        .bind(import_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(count)
    }
}
