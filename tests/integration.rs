//! End-to-end pipeline tests over a tempdir store, a deterministic
//! bag-of-words embedder, and a scripted transcriber. No model runtime
//! or external tool is required; the PDF VLM path needs `pdftoppm` and a
//! live model, so it is exercised at the unit level instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use local_doc_search::chunker::Segment;
use local_doc_search::embedding::Embedder;
use local_doc_search::error::Result;
use local_doc_search::identity::IdentityTracker;
use local_doc_search::models::{Chunk, Document, FileEvent, FileEventKind, MediaType};
use local_doc_search::processors::ProcessorRegistry;
use local_doc_search::scheduler::{index_path, process_resolved, StatsRecorder};
use local_doc_search::search::{search, SearchRequest};
use local_doc_search::store::{SearchFilters, Store};
use local_doc_search::transcribe::{Transcriber, Transcription};
use local_doc_search::watcher::stat_file;
use local_doc_search::{CoreContext, Settings};

const DIMS: usize = 64;

fn test_settings(data_dir: PathBuf) -> Settings {
    Settings {
        ollama_host: "http://localhost:11434".into(),
        data_dir,
        log_level: "info".into(),
        embedding_model: "bge-m3".into(),
        vlm_model: "llava:7b".into(),
        whisper_model: "large-v3-turbo".into(),
        pdf_vlm_model: "minicpm-v".into(),
        pdf_vlm_timeout_secs: 60,
        pdf_vlm_dpi: 150,
        pdf_vlm_max_pages: 20,
        pdf_vlm_workers: 2,
        pdf_min_chars_per_page: 100,
        chunk_size: 800,
        chunk_overlap: 100,
        embed_batch_size: 32,
        embed_timeout_secs: 30,
        embed_cache_mb: 1000,
        workers: 4,
        api_host: "127.0.0.1".into(),
        api_port: 2602,
    }
}

/// Deterministic bag-of-words embedder: every distinct word gets its own
/// slot, plus a shared bias component so unrelated texts still have a
/// small positive similarity (as real embedding models do).
struct StubEmbedder {
    vocab: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Self {
        Self {
            vocab: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; DIMS];
        vec[0] = 2.0;
        let mut vocab = self.vocab.lock();
        for word in text.split_whitespace() {
            let next = vocab.len();
            let slot = *vocab.entry(word.to_string()).or_insert(next);
            vec[1 + (slot % (DIMS - 1))] += 1.0;
        }
        vec
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(texts.len(), Ordering::Relaxed);
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Transcriber returning a fixed segment script for any input.
struct ScriptedTranscriber;

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _audio_path: &Path) -> Result<Transcription> {
        Ok(Transcription {
            text: "welcome to the show today we discuss storage engines".into(),
            language: "en".into(),
            duration: 42.5,
            segments: vec![
                Segment {
                    text: "welcome to the show".into(),
                    start: 0.0,
                    end: 3.5,
                },
                Segment {
                    text: "today we discuss storage engines".into(),
                    start: 12.0,
                    end: 42.5,
                },
            ],
        })
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    ctx: Arc<CoreContext>,
    embedder: Arc<StubEmbedder>,
    files_dir: PathBuf,
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let files_dir = tmp.path().join("files");
    std::fs::create_dir_all(&files_dir).unwrap();

    let settings = test_settings(data_dir);
    settings.ensure_dirs().unwrap();

    let store = Arc::new(Store::open(&settings).await.unwrap());
    let embedder = Arc::new(StubEmbedder::new());
    let registry = Arc::new(
        ProcessorRegistry::with_transcriber(&settings, Arc::new(ScriptedTranscriber)).unwrap(),
    );

    let ctx = Arc::new(CoreContext::with_parts(
        settings,
        store,
        embedder.clone() as Arc<dyn Embedder>,
        registry,
    ));

    Fixture {
        _tmp: tmp,
        ctx,
        embedder,
        files_dir,
    }
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// Pad text to clear the 1 KiB size gate without drowning the signal.
fn padded(text: &str) -> String {
    format!("{text}\n\n{}", "filler passage. ".repeat(80))
}

async fn resolve_and_process(fixture: &Fixture, path: &Path, kind: FileEventKind) -> Document {
    let tracker = IdentityTracker::new(Arc::clone(&fixture.ctx.store));
    let stat = stat_file(path).unwrap_or_default();
    let event = FileEvent {
        kind,
        path: path.to_path_buf(),
        prev_path: None,
        stat,
        media_type: local_doc_search::watcher::classify(path).unwrap_or(MediaType::Document),
    };
    let resolved = tracker.resolve(&event).await.unwrap().unwrap();
    let stats = StatsRecorder::default();
    process_resolved(&fixture.ctx, &resolved, &CancellationToken::new(), &stats)
        .await
        .unwrap();
    resolved.document
}

#[tokio::test]
async fn undersized_file_is_rejected_by_the_gate() {
    let fx = fixture().await;
    write_file(&fx.files_dir, "a.txt", "hello world");

    let report = index_path(&fx.ctx, &fx.files_dir, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.indexed_count, 0);
    assert!(report.paths.is_empty());

    let stats = fx.ctx.store.stats().await.unwrap();
    assert_eq!(stats.total_documents, 0);
}

#[tokio::test]
async fn text_file_round_trips_through_index_and_search() {
    let fx = fixture().await;
    write_file(
        &fx.files_dir,
        "engines.md",
        &padded("The storage engine compacts segments in the background."),
    );

    let report = index_path(&fx.ctx, &fx.files_dir, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.indexed_count, 1);
    assert_eq!(report.stats.text_count, 1);

    let results = search(&fx.ctx, &SearchRequest::new("storage engine compacts"))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].text.contains("compacts"));
    assert_eq!(results[0].media_type, MediaType::Document);
    assert!(results[0].playback_url.is_none());

    // I1/I2 after the apply.
    let doc = fx
        .ctx
        .store
        .find_live_by_path(results[0].path.as_str())
        .await
        .unwrap()
        .unwrap();
    let chunks = fx.ctx.store.chunks_for_document(doc.id).await.unwrap();
    assert_eq!(fx.ctx.store.vectors().chunk_count(), chunks.len());
    for (i, c) in chunks.iter().enumerate() {
        assert_eq!(c.chunk_index, i as i64);
    }
}

#[tokio::test]
async fn reindexing_unchanged_directory_skips_everything() {
    let fx = fixture().await;
    write_file(&fx.files_dir, "a.md", &padded("stable alpha document"));
    write_file(&fx.files_dir, "b.md", &padded("stable beta document"));

    let first = index_path(&fx.ctx, &fx.files_dir, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.indexed_count, 2);

    let embed_calls = fx.embedder.call_count();
    let second = index_path(&fx.ctx, &fx.files_dir, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.indexed_count, 0);
    assert_eq!(second.stats.skipped_count, 2);
    assert_eq!(fx.embedder.call_count(), embed_calls, "no re-embedding");
}

#[tokio::test]
async fn rename_preserves_identity_without_new_embeddings() {
    let fx = fixture().await;
    let old = write_file(
        &fx.files_dir,
        "x/foo.md",
        &padded("content that never changes"),
    );
    let doc = resolve_and_process(&fx, &old, FileEventKind::Created).await;
    let chunk_ids: Vec<_> = fx
        .ctx
        .store
        .chunks_for_document(doc.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();

    let embed_calls = fx.embedder.call_count();

    let new = fx.files_dir.join("y/foo.md");
    std::fs::create_dir_all(new.parent().unwrap()).unwrap();
    std::fs::rename(&old, &new).unwrap();
    let moved = resolve_and_process(&fx, &new, FileEventKind::Moved).await;

    // P4: same document id, same chunk ids, no embedding calls.
    assert_eq!(moved.id, doc.id);
    assert_eq!(fx.embedder.call_count(), embed_calls);

    let stored = fx.ctx.store.get_document(doc.id).await.unwrap().unwrap();
    assert_eq!(stored.path, new.to_string_lossy());
    let chunk_ids_after: Vec<_> = fx
        .ctx
        .store
        .chunks_for_document(doc.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(chunk_ids, chunk_ids_after);
}

#[tokio::test]
async fn modify_replaces_chunks_wholesale() {
    let fx = fixture().await;
    let file = write_file(&fx.files_dir, "doc.md", &padded("the original alpha text"));
    let doc = resolve_and_process(&fx, &file, FileEventKind::Created).await;
    let old_chunk_ids: Vec<_> = fx
        .ctx
        .store
        .chunks_for_document(doc.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();

    std::fs::write(&file, padded("completely rewritten beta text")).unwrap();
    let updated = resolve_and_process(&fx, &file, FileEventKind::Modified).await;
    assert_eq!(updated.id, doc.id);

    let chunks = fx.ctx.store.chunks_for_document(doc.id).await.unwrap();
    assert!(!chunks.is_empty());
    for c in &chunks {
        assert!(!old_chunk_ids.contains(&c.id), "old chunks must be gone");
        assert!(c.text.contains("beta") || c.text.contains("filler"));
    }
    // I1: vector mirror matches the relational chunk set.
    assert_eq!(fx.ctx.store.vectors().chunk_count(), chunks.len());

    let results = search(&fx.ctx, &SearchRequest::new("original alpha"))
        .await
        .unwrap();
    assert!(results.iter().all(|r| !r.text.contains("original alpha")));
}

#[tokio::test]
async fn delete_then_recreate_restores_the_same_document() {
    let fx = fixture().await;
    let file = write_file(&fx.files_dir, "phoenix.md", &padded("rises from ashes"));
    let doc = resolve_and_process(&fx, &file, FileEventKind::Created).await;

    std::fs::remove_file(&file).unwrap();
    let tracker = IdentityTracker::new(Arc::clone(&fx.ctx.store));
    let delete_event = FileEvent {
        kind: FileEventKind::Deleted,
        path: file.clone(),
        prev_path: None,
        stat: Default::default(),
        media_type: MediaType::Document,
    };
    let resolved = tracker.resolve(&delete_event).await.unwrap().unwrap();
    let stats = StatsRecorder::default();
    process_resolved(&fx.ctx, &resolved, &CancellationToken::new(), &stats)
        .await
        .unwrap();

    // I5: tombstoned documents have no live chunks anywhere.
    assert!(fx.ctx.store.chunks_for_document(doc.id).await.unwrap().is_empty());
    assert_eq!(fx.ctx.store.vectors().chunk_count(), 0);
    assert!(search(&fx.ctx, &SearchRequest::new("rises ashes"))
        .await
        .unwrap()
        .is_empty());

    // Same bytes reappear: the tombstone clears and the id survives.
    write_file(&fx.files_dir, "phoenix.md", &padded("rises from ashes"));
    let restored = resolve_and_process(&fx, &file, FileEventKind::Created).await;
    assert_eq!(restored.id, doc.id);
    let stored = fx.ctx.store.get_document(doc.id).await.unwrap().unwrap();
    assert!(!stored.is_deleted);
    assert!(!fx.ctx.store.chunks_for_document(doc.id).await.unwrap().is_empty());
}

/// Seed three single-chunk documents directly through the store with
/// stub embeddings, for precise control over fusion inputs.
async fn seed_corpus(fx: &Fixture, texts: &[&str]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let doc = Document::new(
            Path::new(&format!("/corpus/doc{i}.md")),
            format!("hash-{i}"),
            MediaType::Document,
            &Default::default(),
        );
        let chunk = Chunk {
            id: uuid::Uuid::new_v4(),
            document_id: doc.id,
            chunk_index: 0,
            text: text.to_string(),
            page: None,
            start_time: None,
            end_time: None,
            metadata: serde_json::Value::Object(Default::default()),
        };
        let embedding = fx.embedder.embed_batch(&[text.to_string()]).await.unwrap();
        fx.ctx
            .store
            .apply_upsert(&doc, std::slice::from_ref(&chunk), embedding, DIMS, None)
            .await
            .unwrap();
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn hybrid_search_is_deterministic() {
    let fx = fixture().await;
    let chunks = seed_corpus(
        &fx,
        &[
            "The quick brown fox",
            "Jumps over the lazy dog",
            "Brown fox sleeps",
        ],
    )
    .await;

    let results = search(&fx.ctx, &SearchRequest::new("brown fox"))
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].chunk_id, chunks[0].id, "both rankings favor it");
    assert_eq!(results[1].chunk_id, chunks[2].id);
    assert_eq!(results[2].chunk_id, chunks[1].id);

    // Running the same query again yields the identical ordering.
    let again = search(&fx.ctx, &SearchRequest::new("brown fox"))
        .await
        .unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.chunk_id).collect();
    let ids_again: Vec<_> = again.iter().map(|r| r.chunk_id).collect();
    assert_eq!(ids, ids_again);
}

#[tokio::test]
async fn result_prefix_is_stable_across_limits() {
    let fx = fixture().await;
    seed_corpus(
        &fx,
        &[
            "alpha storage engine design",
            "beta storage engine notes",
            "gamma engine tuning guide",
            "delta unrelated cooking recipe",
            "epsilon storage compaction",
            "zeta engine benchmarks",
        ],
    )
    .await;

    let k3 = search(
        &fx.ctx,
        &SearchRequest {
            limit: 3,
            ..SearchRequest::new("storage engine")
        },
    )
    .await
    .unwrap();
    let k4 = search(
        &fx.ctx,
        &SearchRequest {
            limit: 4,
            ..SearchRequest::new("storage engine")
        },
    )
    .await
    .unwrap();

    assert_eq!(k3.len(), 3);
    assert_eq!(k4.len(), 4);
    for (a, b) in k3.iter().zip(k4.iter()) {
        assert_eq!(a.chunk_id, b.chunk_id);
    }
}

#[tokio::test]
async fn media_type_filter_pushes_down() {
    let fx = fixture().await;
    seed_corpus(&fx, &["searchable document text"]).await;

    let mut filters = SearchFilters::default();
    filters.media_types.push(MediaType::Audio);
    let results = search(
        &fx.ctx,
        &SearchRequest {
            filters,
            ..SearchRequest::new("searchable document")
        },
    )
    .await
    .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn audio_pipeline_produces_timestamps_and_transcript() {
    let fx = fixture().await;
    let audio = fx.files_dir.join("talk.mp3");
    std::fs::write(&audio, vec![0u8; 4096]).unwrap();

    let doc = resolve_and_process(&fx, &audio, FileEventKind::Created).await;

    let stored = fx.ctx.store.get_document(doc.id).await.unwrap().unwrap();
    assert_eq!(stored.media_type, MediaType::Audio);
    assert_eq!(stored.duration_seconds, Some(42.5));

    let chunks = fx.ctx.store.chunks_for_document(doc.id).await.unwrap();
    // The 8.5s silence between segments splits the chunks.
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].start_time, Some(0.0));
    assert_eq!(chunks[0].end_time, Some(3.5));
    assert_eq!(chunks[1].start_time, Some(12.0));

    let transcript = fx.ctx.store.get_transcript(doc.id).await.unwrap().unwrap();
    assert_eq!(transcript.language, "en");
    assert_eq!(transcript.duration_seconds, 42.5);
    assert!(transcript.word_count > 0);

    let results = search(&fx.ctx, &SearchRequest::new("storage engines discuss"))
        .await
        .unwrap();
    let audio_hit = results
        .iter()
        .find(|r| r.media_type == MediaType::Audio)
        .expect("audio chunk should be retrievable");
    assert_eq!(
        audio_hit.playback_url.as_deref(),
        Some(format!("file://{}#t=12", audio.display()).as_str())
    );
}

#[tokio::test]
async fn whitespace_only_document_keeps_row_without_chunks() {
    let fx = fixture().await;
    let file = fx.files_dir.join("blank.txt");
    std::fs::write(&file, " \n".repeat(1024)).unwrap();

    let report = index_path(&fx.ctx, &fx.files_dir, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.indexed_count, 1);

    let doc = fx
        .ctx
        .store
        .find_live_by_path(&file.to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert!(fx.ctx.store.chunks_for_document(doc.id).await.unwrap().is_empty());
    assert_eq!(fx.ctx.store.vectors().chunk_count(), 0);
}

#[tokio::test]
async fn failed_extraction_is_recorded_on_the_document() {
    let fx = fixture().await;
    // A .docx that is not a ZIP archive fails extraction deterministically.
    let bogus = fx.files_dir.join("broken.docx");
    std::fs::write(&bogus, "not a zip ".repeat(200)).unwrap();

    let report = index_path(&fx.ctx, &fx.files_dir, true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.indexed_count, 0);
    assert_eq!(report.stats.error_count, 1);

    let doc = fx
        .ctx
        .store
        .find_live_by_path(&bogus.to_string_lossy())
        .await
        .unwrap()
        .expect("claimed row should exist");
    assert!(doc.last_error.is_some());
}

#[tokio::test]
async fn recovery_after_partial_apply_restores_search_state() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let settings = test_settings(data_dir);
    settings.ensure_dirs().unwrap();

    let embedder = Arc::new(StubEmbedder::new());
    let doc = Document::new(
        Path::new("/corpus/stable.md"),
        "hash-stable".into(),
        MediaType::Document,
        &Default::default(),
    );
    let chunk = Chunk {
        id: uuid::Uuid::new_v4(),
        document_id: doc.id,
        chunk_index: 0,
        text: "durable committed content".into(),
        page: None,
        start_time: None,
        end_time: None,
        metadata: serde_json::Value::Object(Default::default()),
    };

    {
        let store = Store::open(&settings).await.unwrap();
        let embedding = embedder
            .embed_batch(&["durable committed content".to_string()])
            .await
            .unwrap();
        store
            .apply_upsert(&doc, std::slice::from_ref(&chunk), embedding, DIMS, None)
            .await
            .unwrap();

        // Crash mid-upsert of version 2: staged marker + orphan vectors,
        // relational state untouched.
        sqlx::query(
            "INSERT INTO pending_markers (document_id, new_version, phase) VALUES (?, 2, 'staged')",
        )
        .bind(doc.id.to_string())
        .execute(store.pool())
        .await
        .unwrap();
        store
            .vectors()
            .write_file(doc.id, 2, DIMS, &[(uuid::Uuid::new_v4(), vec![0.0; DIMS])])
            .unwrap();
    }

    // P3: restart replays the marker and lands in the pre-upsert state.
    let store = Arc::new(Store::open(&settings).await.unwrap());
    assert_eq!(store.vectors().chunk_count(), 1);
    assert_eq!(store.vectors().scan_files().len(), 1);

    let chunks = store.chunks_for_document(doc.id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].id, chunk.id);

    let registry = Arc::new(
        ProcessorRegistry::with_transcriber(&settings, Arc::new(ScriptedTranscriber)).unwrap(),
    );
    let ctx = CoreContext::with_parts(
        settings,
        store,
        embedder as Arc<dyn Embedder>,
        registry,
    );
    let results = search(&ctx, &SearchRequest::new("durable committed"))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk_id, chunk.id);
}
