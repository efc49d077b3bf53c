//! Dual-index store: SQLite (documents, chunks, FTS5/BM25, transcripts)
//! paired with the on-disk vector index, kept consistent by a two-phase
//! apply.
//!
//! A document upsert is one logical transaction even though it spans two
//! storage engines:
//!
//! 1. write a `staged` marker row for `{document_id, new_version}`;
//! 2. write the new vector file beside the old one;
//! 3. in a single SQLite transaction: replace chunks and FTS rows, upsert
//!    the document with `vector_version = new_version`, flip the marker
//!    to `committed`;
//! 4. delete the old vector file, swap the in-memory mirror, drop the
//!    marker.
//!
//! If the process dies anywhere in between, [`Store::recover`] replays the
//! marker on the next start: a `staged` marker deletes the orphaned new
//! file (the relational state never saw it), a `committed` marker deletes
//! the stale old file. Either way every live chunk row has exactly one
//! vector row afterwards.
//!
//! Writes serialize on a store-level async mutex (single-writer
//! discipline); reads go straight to the pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Settings;
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{
    Chunk, Document, MediaType, Transcript, CHUNK_METADATA_MAX_BYTES,
};
use crate::vectors::VectorIndex;

/// Doc-level filters pushed down into both index searches.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub media_types: Vec<MediaType>,
    pub extensions: Vec<String>,
    pub path_prefix: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.media_types.is_empty()
            && self.extensions.is_empty()
            && self.path_prefix.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
            && self.min_duration.is_none()
            && self.max_duration.is_none()
    }
}

/// A BM25 hit, already joined with document metadata.
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub score: f64,
}

/// A chunk joined with its document, used to enrich fused results.
#[derive(Debug, Clone)]
pub struct EnrichedChunk {
    pub chunk: Chunk,
    pub path: String,
    pub filename: String,
    pub media_type: MediaType,
    pub is_deleted: bool,
}

/// Aggregate counts for `lds status` and `GET /api/documents/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_documents: i64,
    pub by_media_type: BTreeMap<String, i64>,
    pub total_chunks: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

pub struct Store {
    pool: SqlitePool,
    vectors: VectorIndex,
    writer: Mutex<()>,
}

impl Store {
    /// Open the store under the configured data directory, run
    /// migrations, and run the crash-recovery pass.
    pub async fn open(settings: &Settings) -> Result<Self> {
        settings.ensure_dirs()?;
        Self::open_at(&settings.db_path(), &settings.vectors_dir()).await
    }

    /// Open with explicit paths (tests use a tempdir).
    pub async fn open_at(db_path: &Path, vectors_dir: &Path) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::run_migrations(&pool).await?;
        let vectors = VectorIndex::open(vectors_dir)?;

        let store = Self {
            pool,
            vectors,
            writer: Mutex::new(()),
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    // ───────────────────────── documents ─────────────────────────

    /// Insert a bare document row (no chunks yet). Used by identity
    /// resolution before the processor pipeline runs.
    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.upsert_document_row(&self.pool, doc).await
    }

    async fn upsert_document_row<'e, E>(&self, executor: E, doc: &Document) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, content_hash, path, filename, extension, media_type, size, inode,
                 created_at, modified_at, indexed_at, is_deleted, deleted_at,
                 duration_seconds, width, height, vector_version, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content_hash = excluded.content_hash,
                path = excluded.path,
                filename = excluded.filename,
                extension = excluded.extension,
                media_type = excluded.media_type,
                size = excluded.size,
                inode = excluded.inode,
                modified_at = excluded.modified_at,
                indexed_at = excluded.indexed_at,
                is_deleted = excluded.is_deleted,
                deleted_at = excluded.deleted_at,
                duration_seconds = excluded.duration_seconds,
                width = excluded.width,
                height = excluded.height,
                vector_version = excluded.vector_version,
                last_error = excluded.last_error
            "#,
        )
        .bind(doc.id.to_string())
        .bind(&doc.content_hash)
        .bind(&doc.path)
        .bind(&doc.filename)
        .bind(&doc.extension)
        .bind(doc.media_type.as_str())
        .bind(doc.size)
        .bind(doc.inode)
        .bind(doc.created_at.to_rfc3339())
        .bind(doc.modified_at.to_rfc3339())
        .bind(doc.indexed_at.to_rfc3339())
        .bind(doc.is_deleted as i64)
        .bind(doc.deleted_at.map(|t| t.to_rfc3339()))
        .bind(doc.duration_seconds)
        .bind(doc.width)
        .bind(doc.height)
        .bind(doc.vector_version)
        .bind(&doc.last_error)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| doc_from_row(&r)).transpose()
    }

    /// Live (non-tombstoned) document with this content hash.
    pub async fn find_live_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row =
            sqlx::query("SELECT * FROM documents WHERE content_hash = ? AND is_deleted = 0")
                .bind(content_hash)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| doc_from_row(&r)).transpose()
    }

    /// Tombstoned document with this content hash, newest tombstone first.
    pub async fn find_tombstoned_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE content_hash = ? AND is_deleted = 1 \
             ORDER BY deleted_at DESC LIMIT 1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| doc_from_row(&r)).transpose()
    }

    pub async fn find_live_by_inode(&self, inode: i64) -> Result<Option<Document>> {
        if inode == 0 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM documents WHERE inode = ? AND is_deleted = 0")
            .bind(inode)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| doc_from_row(&r)).transpose()
    }

    pub async fn find_live_by_path(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE path = ? AND is_deleted = 0")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| doc_from_row(&r)).transpose()
    }

    /// Metadata-only move: same content at a new path. Chunk ids, vectors,
    /// and embeddings are untouched; FTS path columns follow the file.
    pub async fn rename_document(
        &self,
        id: Uuid,
        new_path: &str,
        new_filename: &str,
        inode: i64,
        modified_at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE documents SET path = ?, filename = ?, inode = ?, modified_at = ? WHERE id = ?",
        )
        .bind(new_path)
        .bind(new_filename)
        .bind(inode)
        .bind(modified_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE chunks_fts SET path = ?, filename = ? WHERE document_id = ?")
            .bind(new_path)
            .bind(new_filename)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Tombstone a document and drop its chunks from every index (I5).
    pub async fn tombstone_document(&self, id: Uuid, reason: Option<&str>) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE documents SET is_deleted = 1, deleted_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(reason)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transcripts WHERE document_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.vectors.evict(id);
        self.vectors.remove_doc_files(id);
        Ok(())
    }

    /// Record a processing failure on the document row.
    pub async fn record_error(&self, id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET last_error = ? WHERE id = ?")
            .bind(message)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─────────────────────── two-phase apply ───────────────────────

    /// Replace a document's content wholesale: all prior chunks and
    /// embeddings go, the new set comes in, and the document row is
    /// updated, atomically from any reader's point of view.
    pub async fn apply_upsert(
        &self,
        doc: &Document,
        chunks: &[Chunk],
        embeddings: Vec<Vec<f32>>,
        dims: usize,
        transcript: Option<&Transcript>,
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(Error::Other(format!(
                "chunk/embedding count mismatch: {} vs {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let _guard = self.writer.lock().await;

        let old_version: i64 = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT vector_version FROM documents WHERE id = ?",
        )
        .bind(doc.id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .flatten()
        .unwrap_or(0);
        let new_version = old_version + 1;

        // Phase 1: stage the marker, then the vector file.
        sqlx::query(
            "INSERT INTO pending_markers (document_id, new_version, phase) \
             VALUES (?, ?, 'staged') \
             ON CONFLICT(document_id) DO UPDATE SET \
               new_version = excluded.new_version, phase = 'staged'",
        )
        .bind(doc.id.to_string())
        .bind(new_version)
        .execute(&self.pool)
        .await?;

        let entries: Vec<(Uuid, Vec<f32>)> = chunks
            .iter()
            .map(|c| c.id)
            .zip(embeddings.into_iter())
            .collect();
        self.vectors.write_file(doc.id, new_version, dims, &entries)?;

        // Phase 2: one relational transaction.
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transcripts WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&mut *tx)
            .await?;

        // The document row must exist before chunk rows reference it.
        let mut committed_doc = doc.clone();
        committed_doc.vector_version = new_version;
        committed_doc.indexed_at = Utc::now();
        committed_doc.is_deleted = false;
        committed_doc.deleted_at = None;
        committed_doc.last_error = None;
        self.upsert_document_row(&mut *tx, &committed_doc).await?;

        for chunk in chunks {
            let mut metadata_json = chunk.metadata.to_string();
            if metadata_json.len() > CHUNK_METADATA_MAX_BYTES {
                metadata_json = "{}".to_string();
            }
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, page, start_time, \
                 end_time, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.to_string())
            .bind(chunk.document_id.to_string())
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.page)
            .bind(chunk.start_time)
            .bind(chunk.end_time)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, text, path, filename) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.to_string())
            .bind(chunk.document_id.to_string())
            .bind(&chunk.text)
            .bind(&doc.path)
            .bind(&doc.filename)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(t) = transcript {
            sqlx::query(
                "INSERT INTO transcripts (id, document_id, full_text, language, \
                 duration_seconds, word_count) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(t.id.to_string())
            .bind(t.document_id.to_string())
            .bind(&t.full_text)
            .bind(&t.language)
            .bind(t.duration_seconds)
            .bind(t.word_count)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE pending_markers SET phase = 'committed' WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Cleanup: old file out, mirror swapped, marker gone.
        if old_version > 0 {
            self.vectors.remove_file(doc.id, old_version);
        }
        self.vectors.install(doc.id, new_version, entries);
        sqlx::query("DELETE FROM pending_markers WHERE document_id = ?")
            .bind(doc.id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Crash-recovery pass, run at open: replay pending markers, sweep
    /// vector files that no live committed document references, and load
    /// the committed files into the search mirror. Returns the number of
    /// files cleaned up.
    pub async fn recover(&self) -> Result<usize> {
        let mut cleaned = 0usize;

        let markers = sqlx::query("SELECT document_id, new_version, phase FROM pending_markers")
            .fetch_all(&self.pool)
            .await?;

        for row in &markers {
            let doc_id: String = row.get("document_id");
            let new_version: i64 = row.get("new_version");
            let phase: String = row.get("phase");
            let doc_id = Uuid::parse_str(&doc_id)
                .map_err(|_| Error::StoreCorruption("bad marker document_id".into()))?;

            match phase.as_str() {
                // Vector writes may have landed without the relational
                // commit; the new file's chunk ids have no rows, drop it.
                "staged" => {
                    self.vectors.remove_file(doc_id, new_version);
                    cleaned += 1;
                    tracing::info!(%doc_id, new_version, "rolled back staged vector write");
                }
                // Relational state committed; only the stale old file can
                // remain.
                _ => {
                    for (d, v, _) in self.vectors.scan_files() {
                        if d == doc_id && v != new_version {
                            self.vectors.remove_file(d, v);
                            cleaned += 1;
                        }
                    }
                }
            }

            sqlx::query("DELETE FROM pending_markers WHERE document_id = ?")
                .bind(doc_id.to_string())
                .execute(&self.pool)
                .await?;
        }

        // Sweep: every surviving file must match a live document's
        // committed version.
        let live_rows =
            sqlx::query("SELECT id, vector_version FROM documents WHERE is_deleted = 0")
                .fetch_all(&self.pool)
                .await?;
        let mut live: HashMap<Uuid, i64> = HashMap::new();
        for row in &live_rows {
            let id: String = row.get("id");
            if let Ok(id) = Uuid::parse_str(&id) {
                live.insert(id, row.get::<i64, _>("vector_version"));
            }
        }

        for (doc_id, version, _) in self.vectors.scan_files() {
            if live.get(&doc_id) != Some(&version) {
                self.vectors.remove_file(doc_id, version);
                cleaned += 1;
            }
        }

        for (doc_id, version) in &live {
            if *version > 0 {
                if let Err(err) = self.vectors.load_committed(*doc_id, *version) {
                    tracing::warn!(%doc_id, version, %err, "vector file missing or bad; document will reindex");
                }
            }
        }

        Ok(cleaned)
    }

    // ───────────────────────── retrieval ─────────────────────────

    /// BM25 search over the FTS5 index with doc-level filters pushed down.
    pub async fn bm25_search(
        &self,
        query: &str,
        limit: i64,
        filters: &SearchFilters,
    ) -> Result<Vec<Bm25Hit>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT chunks_fts.chunk_id, chunks_fts.document_id, chunks_fts.text, \
             bm25(chunks_fts) AS score \
             FROM chunks_fts \
             JOIN documents d ON d.id = chunks_fts.document_id \
             WHERE chunks_fts MATCH ? AND d.is_deleted = 0",
        );
        let mut binds: Vec<String> = vec![fts_query];
        append_filter_sql(&mut sql, &mut binds, filters, "d");
        sql.push_str(" ORDER BY bm25(chunks_fts) LIMIT ?");

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_id: String = row.get("chunk_id");
            let document_id: String = row.get("document_id");
            let (Ok(chunk_id), Ok(document_id)) =
                (Uuid::parse_str(&chunk_id), Uuid::parse_str(&document_id))
            else {
                continue;
            };
            // FTS5 bm25() is negative, more negative = better.
            let score: f64 = row.get::<f64, _>("score").abs();
            hits.push(Bm25Hit {
                chunk_id,
                document_id,
                text: row.get("text"),
                score,
            });
        }
        Ok(hits)
    }

    /// Resolve the set of live document ids matching the filters, for
    /// push-down into the vector scan. `None` means "no filter".
    pub async fn filtered_doc_ids(
        &self,
        filters: &SearchFilters,
    ) -> Result<Option<HashSet<Uuid>>> {
        if filters.is_empty() {
            return Ok(None);
        }

        let mut sql = String::from("SELECT id FROM documents d WHERE d.is_deleted = 0");
        let mut binds: Vec<String> = Vec::new();
        append_filter_sql(&mut sql, &mut binds, filters, "d");

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            if let Ok(id) = Uuid::parse_str(&id) {
                ids.insert(id);
            }
        }
        Ok(Some(ids))
    }

    /// Fetch chunks by id joined with their documents, for result
    /// enrichment after fusion.
    pub async fn enrich_chunks(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, EnrichedChunk>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT c.id, c.document_id, c.chunk_index, c.text, c.page, c.start_time, \
             c.end_time, c.metadata_json, d.path, d.filename, d.media_type, d.is_deleted \
             FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.id IN ({placeholders})"
        );

        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.to_string());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let chunk = chunk_from_row(&row)?;
            let media: String = row.get("media_type");
            out.insert(
                chunk.id,
                EnrichedChunk {
                    path: row.get("path"),
                    filename: row.get("filename"),
                    media_type: MediaType::parse(&media).unwrap_or(MediaType::Document),
                    is_deleted: row.get::<i64, _>("is_deleted") != 0,
                    chunk,
                },
            );
        }
        Ok(out)
    }

    pub async fn chunks_for_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, text, page, start_time, end_time, \
             metadata_json FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn get_transcript(&self, document_id: Uuid) -> Result<Option<Transcript>> {
        let row = sqlx::query("SELECT * FROM transcripts WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let id: String = row.get("id");
        let doc: String = row.get("document_id");
        Ok(Some(Transcript {
            id: Uuid::parse_str(&id).map_err(|_| Error::StoreCorruption("transcript id".into()))?,
            document_id: Uuid::parse_str(&doc)
                .map_err(|_| Error::StoreCorruption("transcript document_id".into()))?,
            full_text: row.get("full_text"),
            language: row.get("language"),
            duration_seconds: row.get("duration_seconds"),
            word_count: row.get("word_count"),
        }))
    }

    // ─────────────────────────── stats ───────────────────────────

    pub async fn stats(&self) -> Result<StoreStats> {
        let total_documents: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE is_deleted = 0")
                .fetch_one(&self.pool)
                .await?;
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT media_type, COUNT(*) AS n FROM documents WHERE is_deleted = 0 \
             GROUP BY media_type",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_media_type = BTreeMap::new();
        for row in rows {
            by_media_type.insert(row.get::<String, _>("media_type"), row.get::<i64, _>("n"));
        }

        let last: Option<String> = sqlx::query_scalar(
            "SELECT MAX(indexed_at) FROM documents WHERE is_deleted = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        let last_indexed_at = last
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(StoreStats {
            total_documents,
            by_media_type,
            total_chunks,
            last_indexed_at,
        })
    }

    /// Distinct parent directories of live documents with file counts.
    pub async fn directories(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT path FROM documents WHERE is_deleted = 0")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for row in rows {
            let path: String = row.get("path");
            let dir = Path::new(&path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            *counts.entry(dir).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    pub async fn recent_documents(&self, limit: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE is_deleted = 0 ORDER BY indexed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(doc_from_row).collect()
    }
}

/// Quote each term so FTS5 treats it literally, OR-joined like the
/// natural-language queries this serves.
fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Append doc-level filter predicates to a query that aliases the
/// documents table as `alias`. Binds line up with `?` order.
fn append_filter_sql(sql: &mut String, binds: &mut Vec<String>, filters: &SearchFilters, alias: &str) {
    if !filters.media_types.is_empty() {
        let ph = vec!["?"; filters.media_types.len()].join(", ");
        sql.push_str(&format!(" AND {alias}.media_type IN ({ph})"));
        for mt in &filters.media_types {
            binds.push(mt.as_str().to_string());
        }
    }
    if !filters.extensions.is_empty() {
        let ph = vec!["?"; filters.extensions.len()].join(", ");
        sql.push_str(&format!(" AND {alias}.extension IN ({ph})"));
        for ext in &filters.extensions {
            let ext = if ext.starts_with('.') {
                ext.clone()
            } else {
                format!(".{ext}")
            };
            binds.push(ext.to_ascii_lowercase());
        }
    }
    if let Some(prefix) = &filters.path_prefix {
        sql.push_str(&format!(" AND {alias}.path LIKE ?"));
        binds.push(format!("{}%", prefix.replace('%', "")));
    }
    if let Some(from) = &filters.date_from {
        sql.push_str(&format!(" AND {alias}.modified_at >= ?"));
        binds.push(from.to_rfc3339());
    }
    if let Some(to) = &filters.date_to {
        sql.push_str(&format!(" AND {alias}.modified_at <= ?"));
        binds.push(to.to_rfc3339());
    }
    if let Some(min) = filters.min_duration {
        sql.push_str(&format!(" AND {alias}.duration_seconds >= ?"));
        binds.push(min.to_string());
    }
    if let Some(max) = filters.max_duration {
        sql.push_str(&format!(" AND {alias}.duration_seconds <= ?"));
        binds.push(max.to_string());
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::StoreCorruption(format!("bad timestamp in store: {raw}")))
}

fn doc_from_row(row: &SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let media: String = row.get("media_type");
    let deleted_at: Option<String> = row.get("deleted_at");
    Ok(Document {
        id: Uuid::parse_str(&id).map_err(|_| Error::StoreCorruption("document id".into()))?,
        content_hash: row.get("content_hash"),
        path: row.get("path"),
        filename: row.get("filename"),
        extension: row.get("extension"),
        media_type: MediaType::parse(&media)
            .ok_or_else(|| Error::StoreCorruption(format!("bad media_type: {media}")))?,
        size: row.get("size"),
        inode: row.get("inode"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        modified_at: parse_ts(&row.get::<String, _>("modified_at"))?,
        indexed_at: parse_ts(&row.get::<String, _>("indexed_at"))?,
        is_deleted: row.get::<i64, _>("is_deleted") != 0,
        deleted_at: deleted_at.as_deref().map(parse_ts).transpose()?,
        duration_seconds: row.get("duration_seconds"),
        width: row.get("width"),
        height: row.get("height"),
        vector_version: row.get("vector_version"),
        last_error: row.get("last_error"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let id: String = row.get("id");
    let document_id: String = row.get("document_id");
    let metadata_json: String = row.get("metadata_json");
    Ok(Chunk {
        id: Uuid::parse_str(&id).map_err(|_| Error::StoreCorruption("chunk id".into()))?,
        document_id: Uuid::parse_str(&document_id)
            .map_err(|_| Error::StoreCorruption("chunk document_id".into()))?,
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        page: row.get("page"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        metadata: serde_json::from_str(&metadata_json)
            .unwrap_or(serde_json::Value::Object(Default::default())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileStat;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_at(&tmp.path().join("docs.db"), &tmp.path().join("vectors"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn make_doc(path: &str, hash: &str) -> Document {
        Document::new(
            Path::new(path),
            hash.to_string(),
            MediaType::Document,
            &FileStat {
                size: 2048,
                inode: 7,
                created_at: None,
                modified_at: None,
            },
        )
    }

    fn make_chunks(doc: &Document, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: Uuid::new_v4(),
                document_id: doc.id,
                chunk_index: i as i64,
                text: t.to_string(),
                page: None,
                start_time: None,
                end_time: None,
                metadata: serde_json::Value::Object(Default::default()),
            })
            .collect()
    }

    fn unit_embeddings(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![1.0 + i as f32, 0.5, 0.25]).collect()
    }

    #[tokio::test]
    async fn upsert_keeps_indexes_consistent() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/data/a.md", "hash-a");
        let chunks = make_chunks(&doc, &["the quick brown fox", "jumps over the lazy dog"]);
        store
            .apply_upsert(&doc, &chunks, unit_embeddings(2), 3, None)
            .await
            .unwrap();

        // I1: one relational row, one FTS row, one vector per chunk.
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n, 2);
        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts, 2);
        assert_eq!(store.vectors().chunk_count(), 2);

        // No marker left behind.
        let markers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_markers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(markers, 0);
    }

    #[tokio::test]
    async fn reupsert_replaces_chunks_wholesale() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/data/a.md", "hash-a");
        let first = make_chunks(&doc, &["old content one", "old content two", "old three"]);
        store
            .apply_upsert(&doc, &first, unit_embeddings(3), 3, None)
            .await
            .unwrap();

        let second = make_chunks(&doc, &["fresh content"]);
        store
            .apply_upsert(&doc, &second, unit_embeddings(1), 3, None)
            .await
            .unwrap();

        let chunks = store.chunks_for_document(doc.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "fresh content");
        assert_eq!(store.vectors().chunk_count(), 1);

        // Only the committed vector file remains on disk.
        assert_eq!(store.vectors().scan_files().len(), 1);
        let stored = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.vector_version, 2);
    }

    #[tokio::test]
    async fn bm25_finds_and_filters() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/data/a.md", "hash-a");
        let chunks = make_chunks(&doc, &["the quick brown fox jumps"]);
        store
            .apply_upsert(&doc, &chunks, unit_embeddings(1), 3, None)
            .await
            .unwrap();

        let hits = store
            .bm25_search("brown fox", 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);

        let filtered = store
            .bm25_search(
                "brown fox",
                10,
                &SearchFilters {
                    media_types: vec![MediaType::Audio],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());

        let by_prefix = store
            .bm25_search(
                "brown fox",
                10,
                &SearchFilters {
                    path_prefix: Some("/data".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_prefix.len(), 1);
    }

    #[tokio::test]
    async fn tombstone_clears_all_indexes() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/data/a.md", "hash-a");
        let chunks = make_chunks(&doc, &["something searchable"]);
        store
            .apply_upsert(&doc, &chunks, unit_embeddings(1), 3, None)
            .await
            .unwrap();

        store.tombstone_document(doc.id, None).await.unwrap();

        let stored = store.get_document(doc.id).await.unwrap().unwrap();
        assert!(stored.is_deleted);
        assert!(stored.deleted_at.is_some());
        assert!(store.chunks_for_document(doc.id).await.unwrap().is_empty());
        assert_eq!(store.vectors().chunk_count(), 0);
        assert!(store.vectors().scan_files().is_empty());
        assert!(store
            .bm25_search("searchable", 10, &SearchFilters::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rename_preserves_chunks_and_updates_fts_path() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/x/foo.md", "hash-a");
        let chunks = make_chunks(&doc, &["immutable content"]);
        let chunk_id = chunks[0].id;
        store
            .apply_upsert(&doc, &chunks, unit_embeddings(1), 3, None)
            .await
            .unwrap();

        store
            .rename_document(doc.id, "/y/foo.md", "foo.md", 9, Utc::now())
            .await
            .unwrap();

        let stored = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.path, "/y/foo.md");
        let chunks_after = store.chunks_for_document(doc.id).await.unwrap();
        assert_eq!(chunks_after.len(), 1);
        assert_eq!(chunks_after[0].id, chunk_id);

        let fts_path: String = sqlx::query_scalar("SELECT path FROM chunks_fts LIMIT 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts_path, "/y/foo.md");
    }

    #[tokio::test]
    async fn recovery_rolls_back_staged_vector_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("docs.db");
        let vdir = tmp.path().join("vectors");

        let doc = make_doc("/data/a.md", "hash-a");
        {
            let store = Store::open_at(&db, &vdir).await.unwrap();
            let chunks = make_chunks(&doc, &["committed state"]);
            store
                .apply_upsert(&doc, &chunks, unit_embeddings(1), 3, None)
                .await
                .unwrap();

            // Simulate a crash between phase 1 and the relational commit:
            // staged marker + new vector file, no relational change.
            sqlx::query(
                "INSERT INTO pending_markers (document_id, new_version, phase) \
                 VALUES (?, 2, 'staged')",
            )
            .bind(doc.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();
            store
                .vectors()
                .write_file(doc.id, 2, 3, &[(Uuid::new_v4(), vec![9.0, 9.0, 9.0])])
                .unwrap();
        }

        // Reopen: recovery must delete the orphan and keep version 1.
        let store = Store::open_at(&db, &vdir).await.unwrap();
        let files = store.vectors().scan_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1, 1);
        assert_eq!(store.vectors().chunk_count(), 1);

        let markers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_markers")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(markers, 0);
    }

    #[tokio::test]
    async fn recovery_finishes_committed_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("docs.db");
        let vdir = tmp.path().join("vectors");

        let doc = make_doc("/data/a.md", "hash-a");
        {
            let store = Store::open_at(&db, &vdir).await.unwrap();
            store
                .apply_upsert(&doc, &make_chunks(&doc, &["v1 state"]), unit_embeddings(1), 3, None)
                .await
                .unwrap();
            store
                .apply_upsert(&doc, &make_chunks(&doc, &["v2 state"]), unit_embeddings(1), 3, None)
                .await
                .unwrap();

            // Simulate a crash after the relational commit of version 2
            // but before cleanup: the stale v1 file is back on disk and
            // the marker still says committed.
            store
                .vectors()
                .write_file(doc.id, 1, 3, &[(Uuid::new_v4(), vec![0.0, 0.0, 0.0])])
                .unwrap();
            sqlx::query(
                "INSERT INTO pending_markers (document_id, new_version, phase) \
                 VALUES (?, 2, 'committed')",
            )
            .bind(doc.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();
        }

        let store = Store::open_at(&db, &vdir).await.unwrap();
        // Replay finishes the cleanup: only the committed version remains.
        let files = store.vectors().scan_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1, 2);
        let stored = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.vector_version, 2);
        assert_eq!(store.vectors().chunk_count(), 1);
    }

    #[tokio::test]
    async fn empty_document_keeps_row_without_chunks() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/data/empty.txt", "hash-e");
        store
            .apply_upsert(&doc, &[], Vec::new(), 3, None)
            .await
            .unwrap();

        assert!(store.get_document(doc.id).await.unwrap().is_some());
        assert!(store.chunks_for_document(doc.id).await.unwrap().is_empty());
        assert_eq!(store.vectors().chunk_count(), 0);
    }

    #[tokio::test]
    async fn identity_lookups() {
        let (_tmp, store) = open_store().await;
        let doc = make_doc("/data/a.md", "hash-a");
        store.insert_document(&doc).await.unwrap();

        assert!(store.find_live_by_hash("hash-a").await.unwrap().is_some());
        assert!(store.find_live_by_hash("hash-z").await.unwrap().is_none());
        assert!(store.find_live_by_inode(7).await.unwrap().is_some());
        assert!(store.find_live_by_path("/data/a.md").await.unwrap().is_some());

        store.tombstone_document(doc.id, None).await.unwrap();
        assert!(store.find_live_by_hash("hash-a").await.unwrap().is_none());
        let tomb = store.find_tombstoned_by_hash("hash-a").await.unwrap();
        assert_eq!(tomb.unwrap().id, doc.id);
    }

    #[tokio::test]
    async fn stats_and_directories() {
        let (_tmp, store) = open_store().await;
        let doc_a = make_doc("/data/a.md", "hash-a");
        let doc_b = make_doc("/data/sub/b.md", "hash-b");
        store
            .apply_upsert(&doc_a, &make_chunks(&doc_a, &["aaa"]), unit_embeddings(1), 3, None)
            .await
            .unwrap();
        store
            .apply_upsert(&doc_b, &make_chunks(&doc_b, &["bbb"]), unit_embeddings(1), 3, None)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.by_media_type.get("document"), Some(&2));
        assert!(stats.last_indexed_at.is_some());

        let dirs = store.directories().await.unwrap();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().any(|(d, n)| d == "/data" && *n == 1));

        let recent = store.recent_documents(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(build_fts_query("brown fox"), "\"brown\" OR \"fox\"");
        assert_eq!(build_fts_query("  "), "");
        assert_eq!(build_fts_query("say \"hi\""), "\"say\" OR \"hi\"");
    }
}
