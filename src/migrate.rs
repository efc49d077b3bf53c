//! Database schema, applied idempotently at startup.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  documents   │──┐  │   chunks     │     │   chunks_fts     │
//! │              │  │  │              │     │   (FTS5/BM25)    │
//! │ id (PK)      │  │  │ id (PK)      │     │ chunk_id UNIDX   │
//! │ content_hash │  └──│ document_id  │     │ document_id UNIDX│
//! │ path, inode  │     │ chunk_index  │     │ text             │
//! │ media_type   │     │ text, page   │     │ path, filename   │
//! │ tombstone    │     │ start/end    │     └──────────────────┘
//! │ vector_ver   │     └──────────────┘
//! └──────────────┘     ┌──────────────┐     ┌──────────────────┐
//!                      │ transcripts  │     │ pending_markers  │
//!                      └──────────────┘     │ (two-phase apply)│
//!                                           └──────────────────┘
//! ```
//!
//! Embedding vectors live outside SQLite, in per-document files under
//! `vectors/`; `pending_markers` makes the cross-store upsert recoverable.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            path TEXT NOT NULL,
            filename TEXT NOT NULL,
            extension TEXT NOT NULL,
            media_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            inode INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            duration_seconds REAL,
            width INTEGER,
            height INTEGER,
            vector_version INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            page INTEGER,
            start_time REAL,
            end_time REAL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcripts (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL UNIQUE,
            full_text TEXT NOT NULL,
            language TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            word_count INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Two-phase apply markers. A row in `staged` means vector-file writes
    // may have happened without the matching relational commit.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_markers (
            document_id TEXT PRIMARY KEY,
            new_version INTEGER NOT NULL,
            phase TEXT NOT NULL CHECK (phase IN ('staged', 'committed'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table (CREATE VIRTUAL TABLE has no IF NOT EXISTS-safe
    // form across versions; probe sqlite_master first).
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                text,
                path,
                filename,
                tokenize='unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_hash_live \
         ON documents(content_hash) WHERE is_deleted = 0",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_inode ON documents(inode)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_path ON documents(path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_indexed_at ON documents(indexed_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = db::connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let fts_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(fts_count, 1);
    }

    #[tokio::test]
    async fn live_hash_uniqueness_allows_tombstoned_duplicates() {
        let pool = db::connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let insert = |id: &str, deleted: i64| {
            format!(
                "INSERT INTO documents (id, content_hash, path, filename, extension, media_type, \
                 size, inode, created_at, modified_at, indexed_at, is_deleted) \
                 VALUES ('{id}', 'h1', '/p/{id}', 'f', '.txt', 'document', 10, 0, \
                 '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', {deleted})"
            )
        };

        sqlx::query(&insert("a", 1)).execute(&pool).await.unwrap();
        // Same hash is fine while the first row is tombstoned.
        sqlx::query(&insert("b", 0)).execute(&pool).await.unwrap();
        // A second live row with the same hash violates the partial index.
        let err = sqlx::query(&insert("c", 0)).execute(&pool).await;
        assert!(err.is_err());
    }
}
