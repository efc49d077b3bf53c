//! local-doc-search: local-first hybrid search over documents, images,
//! audio, and video.
//!
//! Files are tracked by content-addressed identity, extracted by
//! media-typed processors, chunked with locators (page or time
//! interval), embedded through a local Ollama runtime, and stored in a
//! dual index: SQLite FTS5 for BM25 and an on-disk vector index for
//! dense retrieval. Queries fuse both rankings with Reciprocal Rank
//! Fusion. Nothing leaves the host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌───────────────┐
//! │ Watcher  │──▶│ Scheduler │──▶│ Processors │──▶│  Dual store    │
//! │ (notify) │   │ (workers) │   │ pdf/img/av │   │ FTS5 + vectors │
//! └──────────┘   └───────────┘   └────────────┘   └──────┬────────┘
//!                                                        │
//!                              ┌─────────────────────────┤
//!                              ▼                         ▼
//!                        ┌──────────┐             ┌────────────┐
//!                        │   CLI    │             │  HTTP API  │
//!                        │  (lds)   │             │   (axum)   │
//!                        └──────────┘             └────────────┘
//! ```
//!
//! # Indexing flow
//!
//! 1. The [`watcher`] emits [`models::FileEvent`]s for created, modified,
//!    moved, and deleted files, after glob excludes and the size gate.
//! 2. The [`identity`] tracker resolves each event to a document action:
//!    insert, update, rename, restore, or tombstone. Content hash wins
//!    over inode, so renames preserve document identity.
//! 3. The [`scheduler`] runs the per-event pipeline on a worker pool:
//!    the media [`processors`] extract text and locators, the
//!    [`embedding`] gateway produces dense vectors, and the [`store`]
//!    applies everything with a crash-safe two-phase commit.
//!
//! # Query flow
//!
//! [`search`] embeds the query, runs the dense and BM25 scans
//! concurrently with filters pushed down, fuses the rankings with RRF,
//! optionally reranks, and enriches results with document metadata and
//! playback URLs.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven settings and the data directory layout |
//! | [`models`] | Core types: `Document`, `Chunk`, `Transcript`, events |
//! | [`hash`] | Content-addressed file identity |
//! | [`watcher`] | Filesystem events, globs, size gate, discovery |
//! | [`identity`] | Event → document action resolution |
//! | [`chunker`] | Boundary-aware chunking with page/time locators |
//! | [`processors`] | Media-typed extraction pipeline |
//! | [`pdf`] | PDF text pass + per-page VLM fallback |
//! | [`extract`] | Office/plain-text extraction |
//! | [`transcribe`] | Whisper subprocess + ffmpeg/ffprobe helpers |
//! | [`embedding`] | Batched, cached, retried embedding gateway |
//! | [`vlm`] | Vision-language model client |
//! | [`store`] | Dual-index store with two-phase apply and recovery |
//! | [`vectors`] | On-disk vector files + in-memory cosine scan |
//! | [`scheduler`] | Queue, workers, retries, stats, cancellation |
//! | [`search`] | Hybrid retrieval with RRF fusion |
//! | [`rerank`] | Optional embedding-based rerank stage |
//! | [`server`] | Localhost HTTP API (axum) |
//! | [`opener`] | OS open/reveal actions |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod hash;
pub mod identity;
pub mod migrate;
pub mod models;
pub mod opener;
pub mod pdf;
pub mod processors;
pub mod rerank;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod store;
pub mod transcribe;
pub mod vectors;
pub mod vlm;
pub mod watcher;

use std::sync::Arc;

pub use config::Settings;
pub use error::{Error, Result};
pub use store::Store;

/// Shared handles plumbed through the pipeline instead of globals. The
/// only process-wide singleton is the tracing subscriber.
pub struct CoreContext {
    pub config: Settings,
    pub store: Arc<Store>,
    pub embedder: Arc<dyn embedding::Embedder>,
    pub registry: Arc<processors::ProcessorRegistry>,
}

impl CoreContext {
    /// Wire up the production context: open the store (running recovery),
    /// probe the embedding model, and build the processor registry.
    pub async fn init(config: Settings) -> Result<Self> {
        let store = Arc::new(Store::open(&config).await?);
        let embedder: Arc<dyn embedding::Embedder> =
            Arc::new(embedding::OllamaEmbedder::connect(&config).await?);
        let registry = Arc::new(processors::ProcessorRegistry::from_settings(&config)?);

        Ok(Self {
            config,
            store,
            embedder,
            registry,
        })
    }

    /// Assemble a context from prebuilt parts (tests inject stubs).
    pub fn with_parts(
        config: Settings,
        store: Arc<Store>,
        embedder: Arc<dyn embedding::Embedder>,
        registry: Arc<processors::ProcessorRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            registry,
        }
    }
}
