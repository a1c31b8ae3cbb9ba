//! Chunk repository.
//!
//! Chunks carry their byte offsets into the source message, so the
//! original text can always be recovered by slicing. The `embedding`
//! column is written once per chunk; rows where it is still NULL are
//! exactly the work remaining for the embed step.

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{new_v7, ChunkRepository, Error, MessageChunk, NewChunk, Result};

/// PostgreSQL implementation of the chunk store.
pub struct PgChunkRepository {
    pool: Pool<Postgres>,
}

impl PgChunkRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_chunk_row(row: PgRow) -> MessageChunk {
        MessageChunk {
            id: row.get("id"),
            message_id: row.get("message_id"),
            conversation_id: row.get("conversation_id"),
            chunk_index: row.get("chunk_index"),
            content: row.get("content"),
            start_offset: row.get("start_offset"),
            end_offset: row.get("end_offset"),
            embedded_at: row.get("embedded_at"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl ChunkRepository for PgChunkRepository {
    async fn insert_many(&self, chunks: Vec<NewChunk>) -> Result<i64> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut inserted = 0i64;

        for chunk in &chunks {
            let result = sqlx::query(
                r#"
                INSERT INTO message_chunks (id, message_id, conversation_id, chunk_index,
                                            content, start_offset, end_offset, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (message_id, chunk_index) DO NOTHING
                "#,
            )
            .bind(new_v7())
            .bind(chunk.message_id)
            .bind(chunk.conversation_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            inserted += result.rows_affected() as i64;
        }

        tx.commit().await.map_err(Error::Database)?;

        Ok(inserted)
    }

    async fn list_unembedded_for_import(&self, import_id: Uuid) -> Result<Vec<MessageChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT ch.id, ch.message_id, ch.conversation_id, ch.chunk_index, ch.content,
                   ch.start_offset, ch.end_offset, ch.embedded_at, ch.created_at
            FROM message_chunks ch
            JOIN conversations c ON c.id = ch.conversation_id
            WHERE c.import_id = $1 AND ch.embedding IS NULL
            ORDER BY ch.conversation_id ASC, ch.message_id ASC, ch.chunk_index ASC
            "#,
        )
        .bind(import_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_chunk_row).collect())
    }

    async fn store_embedding(&self, chunk_id: Uuid, embedding: &Vector) -> Result<()> {
        let result = sqlx::query(
            "UPDATE message_chunks SET embedding = $2, embedded_at = $3 WHERE id = $1",
        )
        .bind(chunk_id)
        .bind(embedding)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("chunk {}", chunk_id)));
        }

        Ok(())
    }

    async fn embedding_counts_for_import(&self, import_id: Uuid) -> Result<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE ch.embedding IS NOT NULL) AS embedded
            FROM message_chunks ch
            JOIN conversations c ON c.id = ch.conversation_id
            WHERE c.import_id = $1
            "#,
        )
        .bind(import_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok((row.get("total"), row.get("embedded")))
    }
}
