//! Core data types used throughout the pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Watcher → FileEvent → resolve() → ResolvedEvent → Processor → ChunkDraft
//!                                                        ↓
//!                                                  embed() → apply_upsert()
//!                                                        ↓
//!                                                  search() → SearchResult
//! ```
//!
//! A [`Document`] is the tracked file identity (content-addressed, so
//! renames preserve it). A [`Chunk`] is the retrieval granule, owned by
//! exactly one document. Embeddings live in the vector index keyed by
//! `chunk_id` and are never back-linked from chunks.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Media class of a tracked file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Document,
    Image,
    Audio,
    Video,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "svg",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "wmv", "flv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "ogg", "aac", "wma"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "xlsx", "pptx", "txt", "md", "json", "csv", "xml", "html",
];

impl MediaType {
    /// Classify by file extension. Returns `None` for extensions outside
    /// every table; the watcher then falls back to a text-decodability
    /// probe before rejecting the file.
    pub fn from_extension(path: &Path) -> Option<MediaType> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Video)
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Audio)
        } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Document)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Document => "document",
            MediaType::Image => "image",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<MediaType> {
        match s {
            "document" => Some(MediaType::Document),
            "image" => Some(MediaType::Image),
            "audio" => Some(MediaType::Audio),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked file, stored in the `documents` table.
///
/// Identity is content-addressed: `content_hash` is SHA-256 over the first
/// 64 KiB, the last 64 KiB, and the size, so moves and renames resolve to
/// the same row. Deletion is a tombstone (`is_deleted` + `deleted_at`) so
/// a reappearing file can be restored under its original id.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: Uuid,
    pub content_hash: String,
    pub path: String,
    pub filename: String,
    pub extension: String,
    pub media_type: MediaType,
    pub size: i64,
    pub inode: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// Committed version of this document's vector file.
    pub vector_version: i64,
    /// Last processing error recorded by the scheduler, if any.
    pub last_error: Option<String>,
}

impl Document {
    /// Build a fresh document row for a newly seen file.
    pub fn new(path: &Path, content_hash: String, media_type: MediaType, meta: &FileStat) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content_hash,
            path: path.to_string_lossy().into_owned(),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
                .unwrap_or_default(),
            media_type,
            size: meta.size as i64,
            inode: meta.inode as i64,
            created_at: meta.created_at.unwrap_or(now),
            modified_at: meta.modified_at.unwrap_or(now),
            indexed_at: now,
            is_deleted: false,
            deleted_at: None,
            duration_seconds: None,
            width: None,
            height: None,
            vector_version: 0,
            last_error: None,
        }
    }
}

/// Filesystem metadata snapshot taken when an event is observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub size: u64,
    pub inode: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Kind of raw filesystem event emitted by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Moved,
    Deleted,
}

/// A raw filesystem event, after glob and size filtering.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    /// Source path of a move, when the platform reports it.
    pub prev_path: Option<PathBuf>,
    pub stat: FileStat,
    pub media_type: MediaType,
}

/// Action decided by identity resolution for a file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAction {
    /// First time this content has been seen.
    Insert,
    /// Known identity, content changed in place.
    Update,
    /// Same content at a new path; metadata-only refresh.
    Rename,
    /// A tombstoned hash reappeared; clear the tombstone and reprocess.
    Restore,
    /// File removed; tombstone the document.
    Tombstone,
}

/// Output of identity resolution, consumed by the scheduler.
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub document: Document,
    pub action: ResolvedAction,
}

/// A chunk produced by a processor, before ids and embeddings exist.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub text: String,
    pub chunk_index: i64,
    pub page: Option<i64>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

/// A stored chunk, the retrieval granule.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i64,
    pub text: String,
    pub page: Option<i64>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub metadata: serde_json::Value,
}

/// Free-form chunk metadata is stored as JSON text, truncated at this
/// many bytes on write.
pub const CHUNK_METADATA_MAX_BYTES: usize = 4096;

impl Chunk {
    pub fn from_draft(document_id: Uuid, draft: ChunkDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            chunk_index: draft.chunk_index,
            text: draft.text,
            page: draft.page,
            start_time: draft.start_time,
            end_time: draft.end_time,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Audio/video transcript summary, stored in the `transcripts` table.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub id: Uuid,
    pub document_id: Uuid,
    pub full_text: String,
    pub language: String,
    pub duration_seconds: f64,
    pub word_count: i64,
}

/// What a media processor hands back to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub chunks: Vec<ChunkDraft>,
    pub duration_seconds: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub transcript: Option<TranscriptDraft>,
    /// Pages that went through the VLM fallback (PDF pipeline only).
    pub vlm_pages: usize,
}

/// Transcript data before a document id is attached.
#[derive(Debug, Clone)]
pub struct TranscriptDraft {
    pub full_text: String,
    pub language: String,
    pub duration_seconds: f64,
    pub word_count: i64,
}
