//! Filesystem watcher and file discovery.
//!
//! Wraps a recursive `notify` watcher behind a bounded channel of
//! [`FileEvent`]s. Startup does a full walk of each root so existing
//! files flow through the same pipeline as live changes. Every candidate
//! passes exclude globs, the size gate, and media classification before
//! it is emitted; files that are still being written get a short
//! stat-retry with exponential backoff before being dropped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, EventKind, ModifyKind, RenameMode};
use notify::Watcher as _;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::extract::looks_like_text;
use crate::models::{FileEvent, FileEventKind, FileStat, MediaType};

/// Files outside this inclusive size range are rejected.
pub const MIN_FILE_SIZE: u64 = 1024;
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Stat-retry backoff for files still being written.
const STAT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(1000),
];

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.*",
    "**/.*/**",
    "**/node_modules/**",
    "**/.git/**",
    "**/__pycache__/**",
    "**/venv/**",
    "**/.venv/**",
    "**/target/**",
    "**/build/**",
    "**/dist/**",
    "**/.cache/**",
];

/// Glob-based include/exclude decisions for candidate paths.
///
/// Patterns match the path relative to the watched root, so a hidden
/// directory somewhere above the root does not exclude the whole tree.
pub struct EventFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl EventFilter {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        let include = if include_globs.is_empty() {
            None
        } else {
            Some(build_globset(include_globs)?)
        };

        let mut patterns: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        patterns.extend_from_slice(exclude_globs);
        let exclude = build_globset(&patterns)?;

        Ok(Self { include, exclude })
    }

    pub fn allows(&self, path: &Path) -> bool {
        if self.exclude.is_match(path) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(path),
            None => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::ConfigInvalid(format!("bad glob '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| Error::ConfigInvalid(e.to_string()))
}

/// Inclusive size gate: `[1 KiB, 500 MiB]`.
pub fn size_gate(size: u64) -> bool {
    (MIN_FILE_SIZE..=MAX_FILE_SIZE).contains(&size)
}

/// Classify a path, probing unknown extensions for text.
pub fn classify(path: &Path) -> Option<MediaType> {
    match MediaType::from_extension(path) {
        Some(mt) => Some(mt),
        None if looks_like_text(path) => Some(MediaType::Document),
        None => None,
    }
}

fn system_time_to_utc(t: std::time::SystemTime) -> Option<DateTime<Utc>> {
    let secs = t.duration_since(std::time::UNIX_EPOCH).ok()?;
    DateTime::from_timestamp(secs.as_secs() as i64, secs.subsec_nanos())
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Stat a file into a [`FileStat`].
pub fn stat_file(path: &Path) -> std::io::Result<FileStat> {
    let meta = std::fs::metadata(path)?;
    Ok(FileStat {
        size: meta.len(),
        inode: inode_of(&meta),
        created_at: meta.created().ok().and_then(system_time_to_utc),
        modified_at: meta.modified().ok().and_then(system_time_to_utc),
    })
}

/// Stat with backoff for files mid-write. Returns `None` once retries
/// are exhausted; the caller logs and drops the event.
async fn stat_with_retry(path: &Path) -> Option<FileStat> {
    for (attempt, delay) in STAT_BACKOFF.iter().enumerate() {
        match stat_file(path) {
            Ok(stat) => return Some(stat),
            Err(err) => {
                tracing::debug!(path = %path.display(), attempt, %err, "stat failed, backing off");
                tokio::time::sleep(*delay).await;
            }
        }
    }
    stat_file(path).ok()
}

/// Walk a directory and return the files that pass the filter, size
/// gate, and classification. Used by `lds index` and the HTTP index
/// endpoint.
pub fn discover_files(root: &Path, recursive: bool, filter: &EventFilter) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(root);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut out = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if !filter.allows(relative) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !size_gate(meta.len()) {
            tracing::info!(path = %path.display(), size = meta.len(), "SizeGate: rejected");
            continue;
        }
        if classify(path).is_none() {
            tracing::debug!(path = %path.display(), "unclassifiable file skipped");
            continue;
        }
        out.push(path.to_path_buf());
    }
    out.sort();
    out
}

/// Raw event forwarded from the notify callback thread.
#[derive(Debug)]
struct RawEvent {
    kind: FileEventKind,
    path: PathBuf,
    prev_path: Option<PathBuf>,
}

/// Recursive watcher over one or more roots. Dropping the handle stops
/// the watch; the receiver then drains and closes.
pub struct FileWatcher {
    _watcher: notify::RecommendedWatcher,
    _forwarder: tokio::task::JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `roots`, emitting filtered [`FileEvent`]s. Existing
    /// files are scanned first so the receiver sees them as `Created`.
    pub async fn start(
        roots: &[PathBuf],
        filter: EventFilter,
    ) -> Result<(Self, mpsc::Receiver<FileEvent>)> {
        let (raw_tx, raw_rx) = mpsc::channel::<RawEvent>(1024);
        let (event_tx, event_rx) = mpsc::channel::<FileEvent>(1024);

        // The forwarder must exist before the initial scan floods the
        // channel.
        let forwarder = tokio::spawn(forward_events(
            raw_rx,
            event_tx,
            filter,
            roots.to_vec(),
        ));

        for root in roots {
            let root = root.clone();
            let tx = raw_tx.clone();
            tokio::task::spawn_blocking(move || {
                for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                    if entry.file_type().is_file() {
                        let _ = tx.blocking_send(RawEvent {
                            kind: FileEventKind::Created,
                            path: entry.into_path(),
                            prev_path: None,
                        });
                    }
                }
            })
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        }

        let callback_tx = raw_tx.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                for raw in map_notify_event(event) {
                    // Runs on notify's own thread, not in async context.
                    if callback_tx.blocking_send(raw).is_err() {
                        return;
                    }
                }
            },
        )
        .map_err(|e| Error::Other(e.to_string()))?;

        for root in roots {
            watcher
                .watch(root, notify::RecursiveMode::Recursive)
                .map_err(|e| Error::Other(format!("cannot watch {}: {e}", root.display())))?;
            tracing::info!(root = %root.display(), "watching");
        }

        Ok((
            Self {
                _watcher: watcher,
                _forwarder: forwarder,
            },
            event_rx,
        ))
    }
}

/// Translate a notify event into raw pipeline events.
fn map_notify_event(event: notify::Event) -> Vec<RawEvent> {
    let mut out = Vec::new();
    match event.kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            for path in event.paths {
                out.push(RawEvent {
                    kind: FileEventKind::Created,
                    path,
                    prev_path: None,
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() == 2 {
                out.push(RawEvent {
                    kind: FileEventKind::Moved,
                    path: event.paths[1].clone(),
                    prev_path: Some(event.paths[0].clone()),
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                out.push(RawEvent {
                    kind: FileEventKind::Deleted,
                    path,
                    prev_path: None,
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths {
                out.push(RawEvent {
                    kind: FileEventKind::Created,
                    path,
                    prev_path: None,
                });
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths {
                out.push(RawEvent {
                    kind: FileEventKind::Modified,
                    path,
                    prev_path: None,
                });
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                out.push(RawEvent {
                    kind: FileEventKind::Deleted,
                    path,
                    prev_path: None,
                });
            }
        }
        _ => {}
    }
    out
}

/// Strip the first watched root that prefixes the path, so glob
/// decisions are root-relative.
fn relative_to_roots<'a>(path: &'a Path, roots: &[PathBuf]) -> &'a Path {
    for root in roots {
        if let Ok(stripped) = path.strip_prefix(root) {
            return stripped;
        }
    }
    path
}

/// Apply filter, size gate, and classification, then emit downstream.
async fn forward_events(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    event_tx: mpsc::Sender<FileEvent>,
    filter: EventFilter,
    roots: Vec<PathBuf>,
) {
    while let Some(raw) = raw_rx.recv().await {
        if !filter.allows(relative_to_roots(&raw.path, &roots)) {
            continue;
        }

        let event = match raw.kind {
            FileEventKind::Deleted => FileEvent {
                kind: FileEventKind::Deleted,
                media_type: MediaType::from_extension(&raw.path).unwrap_or(MediaType::Document),
                path: raw.path,
                prev_path: None,
                stat: FileStat::default(),
            },
            kind => {
                let Some(stat) = stat_with_retry(&raw.path).await else {
                    tracing::warn!(path = %raw.path.display(), "dropping event, file unreadable");
                    continue;
                };
                if !size_gate(stat.size) {
                    tracing::info!(
                        path = %raw.path.display(),
                        size = stat.size,
                        "SizeGate: rejected"
                    );
                    continue;
                }
                let Some(media_type) = classify(&raw.path) else {
                    tracing::debug!(path = %raw.path.display(), "unclassifiable file skipped");
                    continue;
                };
                FileEvent {
                    kind,
                    path: raw.path,
                    prev_path: raw.prev_path,
                    stat,
                    media_type,
                }
            }
        };

        if event_tx.send(event).await.is_err() {
            return;
        }
    }
}
