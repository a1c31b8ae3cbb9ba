//! Capture repository.
//!
//! A capture row holds the raw pasted text plus everything the reduction
//! derives from it: the normalized transcript (so resumed jobs never
//! re-parse), the diagnostics document and the extracted tags.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{
    new_v7, CaptureMode, CreateImport, Error, ImportRecord, ImportRepository, ImportStatus, Result,
};

/// BLAKE3 hex digest of a capture's raw text, used for duplicate
/// detection at submission time.
pub fn compute_content_hash(raw_text: &str) -> String {
    blake3::hash(raw_text.as_bytes()).to_hex().to_string()
}

/// PostgreSQL implementation of the capture store.
pub struct PgImportRepository {
    pool: Pool<Postgres>,
}

impl PgImportRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_import_row(row: PgRow) -> ImportRecord {
        let mode: String = row.get("mode");
        let status: String = row.get("status");

        ImportRecord {
            id: row.get("id"),
            user_id: row.get("user_id"),
            mode: CaptureMode::parse(&mode).unwrap_or_default(),
            title: row.get("title"),
            raw_text: row.get("raw_text"),
            content_hash: row.get("content_hash"),
            status: ImportStatus::parse(&status).unwrap_or(ImportStatus::Received),
            normalized: row.get("normalized"),
            diagnostics: row.get("diagnostics"),
            tags: row.get("tags"),
            tag_suggestions: row.get("tag_suggestions"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl ImportRepository for PgImportRepository {
    async fn create(&self, req: CreateImport) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO imports (id, user_id, mode, title, raw_text, content_hash,
                                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'received', $7, $7)
            "#,
        )
        .bind(id)
        .bind(req.user_id)
        .bind(req.mode.as_str())
        .bind(&req.title)
        .bind(&req.raw_text)
        .bind(&req.content_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImportRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, mode, title, raw_text, content_hash, status,
                   normalized, diagnostics, tags, tag_suggestions, created_at, updated_at
            FROM imports
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_import_row))
    }

    async fn set_status(&self, id: Uuid, status: ImportStatus) -> Result<()> {
        let result = sqlx::query("UPDATE imports SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ImportNotFound(id));
        }

        Ok(())
    }

    async fn store_normalized(&self, id: Uuid, normalized: &JsonValue) -> Result<()> {
        let result =
            sqlx::query("UPDATE imports SET normalized = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(normalized)
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ImportNotFound(id));
        }

        Ok(())
    }

    async fn store_diagnostics(&self, id: Uuid, diagnostics: &JsonValue) -> Result<()> {
        let result =
            sqlx::query("UPDATE imports SET diagnostics = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(diagnostics)
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ImportNotFound(id));
        }

        Ok(())
    }

    async fn store_tags(&self, id: Uuid, tags: &[String], suggestions: &[String]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE imports SET tags = $2, tag_suggestions = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(tags)
        .bind(suggestions)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ImportNotFound(id));
        }

        Ok(())
    }

    async fn find_by_content_hash(&self, user_id: Uuid, hash: &str) -> Result<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM imports
            WHERE user_id = $1 AND content_hash = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = compute_content_hash("User: hello\nAssistant: hi");
        let b = compute_content_hash("User: hello\nAssistant: hi");
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_hash_is_hex_of_fixed_length() {
        let hash = compute_content_hash("anything");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_hash_differs_on_whitespace() {
        // Duplicate detection is byte-exact; a trailing newline is a
        // different capture.
        assert_ne!(compute_content_hash("hello"), compute_content_hash("hello\n"));
    }
}
