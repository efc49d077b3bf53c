//! Indexing scheduler: bounded queue, worker pool, retries, stats, and
//! cooperative cancellation.
//!
//! Workers pull [`ResolvedEvent`]s off a shared bounded channel and run
//! the per-event pipeline: claim → process → embed → two-phase apply.
//! Events for the same document serialize through an in-flight set (a
//! second event for a busy document is requeued); events across
//! documents interleave freely. Failures retry with exponential backoff
//! before being recorded on the document; fatal errors halt the
//! scheduler and flip the degraded flag the API watches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::IdentityTracker;
use crate::models::{
    Chunk, MediaType, ProcessOutput, ResolvedAction, ResolvedEvent, Transcript,
};
use crate::pdf::EXTRACTION_FAILED;
use crate::watcher::{discover_files, stat_file, EventFilter};
use crate::CoreContext;

/// Queue capacity; submissions beyond this fail with `QueueFull`.
pub const QUEUE_CAPACITY: usize = 10_000;
const MAX_ATTEMPTS: u32 = 3;

/// Per-document wall-clock budgets by media type.
fn media_budget(media_type: MediaType) -> Duration {
    match media_type {
        MediaType::Document => Duration::from_secs(60),
        MediaType::Image => Duration::from_secs(30),
        MediaType::Audio | MediaType::Video => Duration::from_secs(30 * 60),
    }
}

/// Point-in-time counters snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Stats {
    pub pdf_count: u64,
    pub vlm_pages_processed: u64,
    pub image_count: u64,
    pub audio_count: u64,
    pub video_count: u64,
    pub text_count: u64,
    pub skipped_count: u64,
    pub error_count: u64,
    pub elapsed_seconds: f64,
}

/// Shared atomic counters behind [`Stats`].
#[derive(Debug)]
pub struct StatsRecorder {
    pdf: AtomicU64,
    vlm_pages: AtomicU64,
    image: AtomicU64,
    audio: AtomicU64,
    video: AtomicU64,
    text: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    started: std::time::Instant,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self {
            pdf: AtomicU64::new(0),
            vlm_pages: AtomicU64::new(0),
            image: AtomicU64::new(0),
            audio: AtomicU64::new(0),
            video: AtomicU64::new(0),
            text: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: std::time::Instant::now(),
        }
    }
}

impl StatsRecorder {
    fn record_success(&self, media_type: MediaType, is_pdf: bool, output: &ProcessOutput) {
        match media_type {
            MediaType::Document if is_pdf => {
                self.pdf.fetch_add(1, Ordering::Relaxed);
                self.vlm_pages
                    .fetch_add(output.vlm_pages as u64, Ordering::Relaxed);
            }
            MediaType::Document => {
                self.text.fetch_add(1, Ordering::Relaxed);
            }
            MediaType::Image => {
                self.image.fetch_add(1, Ordering::Relaxed);
            }
            MediaType::Audio => {
                self.audio.fetch_add(1, Ordering::Relaxed);
            }
            MediaType::Video => {
                self.video.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            pdf_count: self.pdf.load(Ordering::Relaxed),
            vlm_pages_processed: self.vlm_pages.load(Ordering::Relaxed),
            image_count: self.image.load(Ordering::Relaxed),
            audio_count: self.audio.load(Ordering::Relaxed),
            video_count: self.video.load(Ordering::Relaxed),
            text_count: self.text.load(Ordering::Relaxed),
            skipped_count: self.skipped.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

pub struct Scheduler {
    tx: mpsc::Sender<ResolvedEvent>,
    stats: Arc<StatsRecorder>,
    cancel: CancellationToken,
    degraded: Arc<AtomicBool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker pool. `cancel` is the root of the cancellation
    /// tree; every external call below runs under a child of it.
    pub fn start(ctx: Arc<CoreContext>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel::<ResolvedEvent>(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(StatsRecorder::default());
        let degraded = Arc::new(AtomicBool::new(false));
        let in_flight: Arc<SyncMutex<HashSet<Uuid>>> = Arc::new(SyncMutex::new(HashSet::new()));

        // One shared child token for the pool: a fatal error in any
        // worker cancels every sibling, while the caller's root token
        // stays usable for the rest of the process.
        let pool_cancel = cancel.child_token();
        let mut workers = Vec::with_capacity(ctx.config.workers);
        for worker_id in 0..ctx.config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&ctx),
                Arc::clone(&rx),
                tx.clone(),
                Arc::clone(&stats),
                pool_cancel.clone(),
                Arc::clone(&degraded),
                Arc::clone(&in_flight),
            )));
        }

        Self {
            tx,
            stats,
            cancel,
            degraded,
            workers,
        }
    }

    /// Enqueue a resolved event; fails fast when the queue is full.
    pub fn submit(&self, event: ResolvedEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::Cancelled,
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    pub fn recorder(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Cancel all workers and wait for them to wind down. In-flight model
    /// calls abort at the next suspension point.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    ctx: Arc<CoreContext>,
    rx: Arc<Mutex<mpsc::Receiver<ResolvedEvent>>>,
    tx: mpsc::Sender<ResolvedEvent>,
    stats: Arc<StatsRecorder>,
    cancel: CancellationToken,
    degraded: Arc<AtomicBool>,
    in_flight: Arc<SyncMutex<HashSet<Uuid>>>,
) {
    loop {
        let event = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = guard.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            }
        };

        let doc_id = event.document.id;

        // Per-document monitor: a second event for a document already
        // being processed goes back to the queue. try_send avoids a
        // deadlock when the queue is saturated; losing the event then is
        // no worse than the submit-side QueueFull drop.
        if !in_flight.lock().insert(doc_id) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Err(err) = tx.try_send(event) {
                tracing::warn!(%doc_id, %err, "requeue failed, event dropped");
            }
            continue;
        }

        let outcome = run_with_retries(&ctx, &event, &cancel, &stats).await;
        in_flight.lock().remove(&doc_id);

        match outcome {
            Ok(()) => {}
            Err(err) if matches!(err, Error::Cancelled) => {
                tracing::debug!(worker_id, %doc_id, "event cancelled");
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(worker_id, %doc_id, %err, "fatal error; scheduler halting");
                degraded.store(true, Ordering::Relaxed);
                cancel.cancel();
                break;
            }
            Err(err) => {
                stats.record_error();
                tracing::error!(worker_id, %doc_id, %err, "event failed permanently");
            }
        }
    }

    tracing::debug!(worker_id, "worker stopped");
}

async fn run_with_retries(
    ctx: &CoreContext,
    event: &ResolvedEvent,
    cancel: &CancellationToken,
    stats: &StatsRecorder,
) -> Result<()> {
    let mut last_err: Option<Error> = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(500 * (1 << (attempt - 1)))).await;
        }

        match process_resolved(ctx, event, cancel, stats).await {
            Ok(()) => return Ok(()),
            Err(err) if matches!(err, Error::Cancelled) || err.is_fatal() => return Err(err),
            Err(err) if !err.is_retryable() => {
                last_err = Some(err);
                break;
            }
            Err(err) => {
                tracing::warn!(
                    doc = %event.document.id,
                    attempt = attempt + 1,
                    %err,
                    "processing failed, will retry"
                );
                last_err = Some(err);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| Error::Other("retries exhausted".into()));

    // A PDF with no extractable page at all is tombstoned rather than
    // left as a live document with zero chunks.
    let is_failed_extraction =
        matches!(&err, Error::Extraction { message, .. } if message == EXTRACTION_FAILED);
    if is_failed_extraction {
        ctx.store
            .tombstone_document(event.document.id, Some(EXTRACTION_FAILED))
            .await?;
    } else {
        ctx.store
            .record_error(event.document.id, &err.to_string())
            .await?;
    }

    Err(err)
}

/// The per-event pipeline shared by scheduler workers and the direct
/// indexing path.
pub async fn process_resolved(
    ctx: &CoreContext,
    event: &ResolvedEvent,
    cancel: &CancellationToken,
    stats: &StatsRecorder,
) -> Result<()> {
    let doc = &event.document;

    match event.action {
        ResolvedAction::Tombstone => {
            ctx.store.tombstone_document(doc.id, None).await?;
            tracing::info!(path = %doc.path, "tombstoned");
            return Ok(());
        }
        ResolvedAction::Rename => {
            ctx.store
                .rename_document(doc.id, &doc.path, &doc.filename, doc.inode, doc.modified_at)
                .await?;
            tracing::info!(path = %doc.path, "renamed");
            return Ok(());
        }
        ResolvedAction::Insert | ResolvedAction::Update | ResolvedAction::Restore => {}
    }

    // Claim: the registry row exists (and is visible to `status`) before
    // the potentially slow processing starts.
    ctx.store.insert_document(doc).await?;

    let is_pdf = doc.extension == ".pdf";
    let budget = media_budget(doc.media_type);
    let path = std::path::Path::new(&doc.path);

    let output = tokio::time::timeout(
        budget,
        ctx.registry.process(doc.media_type, path, cancel),
    )
    .await
    .unwrap_or(Err(Error::ModelTimeout {
        seconds: budget.as_secs(),
    }))?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let chunks: Vec<Chunk> = output
        .chunks
        .iter()
        .cloned()
        .map(|draft| Chunk::from_draft(doc.id, draft))
        .collect();

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = if texts.is_empty() {
        Vec::new()
    } else {
        ctx.embedder.embed_batch(&texts).await?
    };

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut updated = doc.clone();
    updated.duration_seconds = output.duration_seconds.or(doc.duration_seconds);
    updated.width = output.width.or(doc.width);
    updated.height = output.height.or(doc.height);

    let transcript = output.transcript.as_ref().map(|t| Transcript {
        id: Uuid::new_v4(),
        document_id: doc.id,
        full_text: t.full_text.clone(),
        language: t.language.clone(),
        duration_seconds: t.duration_seconds,
        word_count: t.word_count,
    });

    ctx.store
        .apply_upsert(
            &updated,
            &chunks,
            embeddings,
            ctx.embedder.dims(),
            transcript.as_ref(),
        )
        .await?;

    stats.record_success(doc.media_type, is_pdf, &output);
    tracing::info!(
        path = %doc.path,
        chunks = chunks.len(),
        action = ?event.action,
        "indexed"
    );
    Ok(())
}

/// Report returned by the direct indexing path.
#[derive(Debug, serde::Serialize)]
pub struct IndexReport {
    pub indexed_count: usize,
    pub paths: Vec<String>,
    pub stats: Stats,
    pub processing_time_seconds: f64,
}

/// Index a file or directory synchronously: discover, resolve identity,
/// and run the pipeline file by file. Used by `lds index` and
/// `POST /api/documents/index`.
pub async fn index_path(
    ctx: &CoreContext,
    root: &std::path::Path,
    recursive: bool,
    cancel: &CancellationToken,
) -> Result<IndexReport> {
    let started = std::time::Instant::now();
    let stats = StatsRecorder::default();
    let tracker = IdentityTracker::new(Arc::clone(&ctx.store));

    let files = if root.is_file() {
        vec![root.to_path_buf()]
    } else {
        let filter = EventFilter::new(&[], &[])?;
        discover_files(root, recursive, &filter)
    };

    let mut indexed_paths = Vec::new();
    for file in files {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Ok(stat) = stat_file(&file) else {
            stats.record_skipped();
            continue;
        };
        if !crate::watcher::size_gate(stat.size) {
            tracing::info!(path = %file.display(), size = stat.size, "SizeGate: rejected");
            stats.record_skipped();
            continue;
        }
        let Some(media_type) = crate::watcher::classify(&file) else {
            stats.record_skipped();
            continue;
        };

        let event = crate::models::FileEvent {
            kind: crate::models::FileEventKind::Created,
            path: file.clone(),
            prev_path: None,
            stat,
            media_type,
        };

        match tracker.resolve(&event).await? {
            None => stats.record_skipped(),
            Some(resolved) => {
                match process_resolved(ctx, &resolved, cancel, &stats).await {
                    Ok(()) => indexed_paths.push(file.to_string_lossy().into_owned()),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        stats.record_error();
                        ctx.store
                            .record_error(resolved.document.id, &err.to_string())
                            .await?;
                        tracing::warn!(path = %file.display(), %err, "file failed to index");
                    }
                }
            }
        }
    }

    Ok(IndexReport {
        indexed_count: indexed_paths.len(),
        paths: indexed_paths,
        stats: stats.snapshot(),
        processing_time_seconds: started.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_match_media_types() {
        assert_eq!(media_budget(MediaType::Document), Duration::from_secs(60));
        assert_eq!(media_budget(MediaType::Image), Duration::from_secs(30));
        assert_eq!(media_budget(MediaType::Audio), Duration::from_secs(1800));
        assert_eq!(media_budget(MediaType::Video), Duration::from_secs(1800));
    }

    #[test]
    fn stats_snapshot_counts() {
        let recorder = StatsRecorder::default();
        recorder.record_success(
            MediaType::Document,
            true,
            &ProcessOutput {
                vlm_pages: 3,
                ..Default::default()
            },
        );
        recorder.record_success(MediaType::Document, false, &ProcessOutput::default());
        recorder.record_success(MediaType::Audio, false, &ProcessOutput::default());
        recorder.record_skipped();

        let stats = recorder.snapshot();
        assert_eq!(stats.pdf_count, 1);
        assert_eq!(stats.vlm_pages_processed, 3);
        assert_eq!(stats.text_count, 1);
        assert_eq!(stats.audio_count, 1);
        assert_eq!(stats.skipped_count, 1);
        assert_eq!(stats.error_count, 0);
    }
}
