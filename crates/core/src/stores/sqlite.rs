//! SQLite-backed [`DocumentStore`].
//!
//! One `documents` table; the schema is created on connect. Timestamps are
//! stored as RFC 3339 text.

use crate::error::StoreError;
use crate::models::{Document, DocumentStatus};
use crate::traits::DocumentStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    file_path TEXT NOT NULL UNIQUE,
    page_count INTEGER NOT NULL CHECK (page_count >= 1),
    content_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    chunk_count INTEGER,
    indexed_at TEXT NOT NULL
)
"#;

const INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents (content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents (status)",
];

const COLUMNS: &str =
    "id, name, file_path, page_count, content_hash, status, error_message, chunk_count, indexed_at";

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub async fn connect(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, mainly for tests.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        for statement in INDEXES {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StoreError> {
    let status: String = row.try_get("status")?;
    let status = DocumentStatus::from_str(&status).map_err(|details| StoreError::BackendResponse {
        backend: "sqlite".to_string(),
        details,
    })?;

    let indexed_at: String = row.try_get("indexed_at")?;
    let indexed_at = DateTime::parse_from_rfc3339(&indexed_at)
        .map_err(|error| StoreError::BackendResponse {
            backend: "sqlite".to_string(),
            details: format!("bad indexed_at {indexed_at}: {error}"),
        })?
        .with_timezone(&Utc);

    let page_count: i64 = row.try_get("page_count")?;
    let chunk_count: Option<i64> = row.try_get("chunk_count")?;

    Ok(Document {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        file_path: row.try_get("file_path")?,
        page_count: u32::try_from(page_count).unwrap_or(u32::MAX).max(1),
        content_hash: row.try_get("content_hash")?,
        status,
        error_message: row.try_get("error_message")?,
        chunk_count: chunk_count.and_then(|count| u32::try_from(count).ok()),
        indexed_at,
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert(&self, document: &Document) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, name, file_path, page_count, content_hash, status,
                                   error_message, chunk_count, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                file_path = excluded.file_path,
                page_count = excluded.page_count,
                content_hash = excluded.content_hash,
                status = excluded.status,
                error_message = excluded.error_message,
                chunk_count = excluded.chunk_count,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&document.id)
        .bind(&document.name)
        .bind(&document.file_path)
        .bind(i64::from(document.page_count))
        .bind(&document.content_hash)
        .bind(document.status.as_str())
        .bind(&document.error_message)
        .bind(document.chunk_count.map(i64::from))
        .bind(document.indexed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, document: &Document) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET name = ?, file_path = ?, page_count = ?, content_hash = ?, status = ?,
                error_message = ?, chunk_count = ?, indexed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&document.name)
        .bind(&document.file_path)
        .bind(i64::from(document.page_count))
        .bind(&document.content_hash)
        .bind(document.status.as_str())
        .bind(&document.error_message)
        .bind(document.chunk_count.map(i64::from))
        .bind(document.indexed_at.to_rfc3339())
        .bind(&document.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Request(format!("unknown document {}", document.id)));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM documents WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_by_path(&self, file_path: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM documents WHERE file_path = ?"))
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_completed_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM documents WHERE content_hash = ? AND status = 'completed' \
             ORDER BY indexed_at LIMIT 1"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM documents WHERE status = ? ORDER BY name, id"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM documents ORDER BY name, id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_document).collect()
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM documents").execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn documents_round_trip_through_sqlite() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteDocumentStore::connect_in_memory().await?;
        let mut document = Document::new("doc-1", "handbook.pdf", "/data/handbook.pdf", 45, "abc");
        store.insert(&document).await?;

        document.mark_processing()?;
        document.mark_completed(17)?;
        store.update(&document).await?;

        let stored = store.get("doc-1").await?.ok_or("missing document")?;
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert_eq!(stored.chunk_count, Some(17));
        assert_eq!(stored.page_count, 45);
        assert_eq!(stored.indexed_at.timestamp(), document.indexed_at.timestamp());

        let by_hash = store.find_completed_by_hash("abc").await?;
        assert_eq!(by_hash.map(|d| d.id), Some("doc-1".to_string()));
        assert!(store.find_by_path("/data/handbook.pdf").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn list_filters_by_status() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteDocumentStore::connect_in_memory().await?;
        let mut failed = Document::new("f", "locked.pdf", "/locked.pdf", 1, "h1");
        failed.mark_processing()?;
        failed.mark_failed("Encrypted")?;
        store.insert(&failed).await?;
        store.insert(&Document::new("p", "new.pdf", "/new.pdf", 2, "h2")).await?;

        let failures = store.list(Some(DocumentStatus::Failed)).await?;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_message.as_deref(), Some("Encrypted"));
        assert_eq!(store.list(None).await?.len(), 2);
        assert_eq!(store.delete_all().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn updating_unknown_document_fails() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteDocumentStore::connect_in_memory().await?;
        let document = Document::new("ghost", "ghost.pdf", "/ghost.pdf", 1, "h");
        assert!(matches!(store.update(&document).await, Err(StoreError::Request(_))));
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_store_creates_parent_directories() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("metadata.db");
        let store = SqliteDocumentStore::connect(&path).await?;
        store.insert(&Document::new("d", "d.pdf", "/d.pdf", 1, "h")).await?;
        assert!(path.exists());
        Ok(())
    }
}
