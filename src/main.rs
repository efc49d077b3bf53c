//! # local-doc-search CLI (`lds`)
//!
//! ```bash
//! lds index ~/Documents            # index a directory once
//! lds search "quarterly report"    # hybrid search
//! lds watch ~/Documents ~/Media    # watch and index continuously
//! lds status                       # what is indexed
//! lds serve                        # start the localhost HTTP API
//! ```
//!
//! Exit codes: 0 success, 2 configuration error, 3 model runtime
//! unreachable, 4 corrupted store, 1 anything else.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use local_doc_search::identity::IdentityTracker;
use local_doc_search::models::MediaType;
use local_doc_search::scheduler::{self, Scheduler};
use local_doc_search::search::{self, SearchRequest};
use local_doc_search::store::SearchFilters;
use local_doc_search::watcher::{EventFilter, FileWatcher};
use local_doc_search::{CoreContext, Error, Settings, Store};

/// Local-first hybrid search over documents, images, audio, and video.
///
/// All configuration comes from environment variables (`OLLAMA_HOST`,
/// `DATA_DIR`, `EMBEDDING_MODEL`, ...); see the crate documentation.
#[derive(Parser)]
#[command(
    name = "lds",
    about = "Local hybrid search over documents, images, audio, and video",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a file or directory once.
    Index {
        /// File or directory to index.
        path: PathBuf,

        /// Recurse into subdirectories (pass `--recursive false` for a
        /// shallow index).
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        recursive: bool,
    },

    /// Search the index.
    Search {
        /// The natural-language query.
        query: String,

        /// Maximum number of results (1-100).
        #[arg(long)]
        limit: Option<usize>,

        /// Filter by media type: document, image, audio, or video.
        #[arg(long = "type")]
        media_type: Option<String>,

        /// Rerank the top candidates before returning.
        #[arg(long)]
        rerank: bool,

        /// Emit results as JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Watch directories and index changes continuously.
    Watch {
        /// Directories to watch.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show index statistics.
    Status,

    /// Start the localhost HTTP API.
    Serve {
        /// Bind host.
        #[arg(long)]
        host: Option<String>,

        /// Bind port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error ({}): {err}", err.kind());
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli) -> local_doc_search::Result<()> {
    let settings = Settings::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Index { path, recursive } => {
            if !path.exists() {
                return Err(Error::ConfigInvalid(format!(
                    "path does not exist: {}",
                    path.display()
                )));
            }
            let ctx = Arc::new(CoreContext::init(settings).await?);
            let cancel = CancellationToken::new();
            let report = scheduler::index_path(&ctx, &path, recursive, &cancel).await?;

            println!("indexed {} files", report.indexed_count);
            let stats = &report.stats;
            println!(
                "  pdf: {}  text: {}  image: {}  audio: {}  video: {}",
                stats.pdf_count,
                stats.text_count,
                stats.image_count,
                stats.audio_count,
                stats.video_count
            );
            if stats.vlm_pages_processed > 0 {
                println!("  vlm pages: {}", stats.vlm_pages_processed);
            }
            if stats.skipped_count > 0 {
                println!("  skipped: {}", stats.skipped_count);
            }
            if stats.error_count > 0 {
                println!("  errors: {}", stats.error_count);
            }
            println!("  took: {:.1}s", report.processing_time_seconds);
        }

        Commands::Search {
            query,
            limit,
            media_type,
            rerank,
            json,
        } => {
            let mut filters = SearchFilters::default();
            if let Some(raw) = &media_type {
                let media = MediaType::parse(raw).ok_or_else(|| {
                    Error::ConfigInvalid(format!("unknown media type: {raw}"))
                })?;
                filters.media_types.push(media);
            }

            let request = SearchRequest {
                query,
                limit: search::clamp_limit(limit)?,
                filters,
                rerank,
            };

            let ctx = Arc::new(CoreContext::init(settings).await?);
            let results = search::search(&ctx, &request).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&results)
                        .map_err(|e| Error::Other(e.to_string()))?
                );
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!("{}. [{:.4}] {} ({})", i + 1, r.score, r.path, r.media_type);
                    if let Some(page) = r.page {
                        println!("   page {page}");
                    }
                    if let (Some(start), Some(end)) = (r.start_time, r.end_time) {
                        println!("   {start:.1}s – {end:.1}s");
                    }
                    if let Some(url) = &r.playback_url {
                        println!("   {url}");
                    }
                    let preview: String = r.text.chars().take(200).collect();
                    println!("   {preview}");
                }
            }
        }

        Commands::Watch { paths } => {
            for path in &paths {
                if !path.is_dir() {
                    return Err(Error::ConfigInvalid(format!(
                        "not a directory: {}",
                        path.display()
                    )));
                }
            }

            let ctx = Arc::new(CoreContext::init(settings).await?);
            let cancel = CancellationToken::new();
            let scheduler = Scheduler::start(Arc::clone(&ctx), cancel.clone());
            let tracker = IdentityTracker::new(Arc::clone(&ctx.store));

            let filter = EventFilter::new(&[], &[])?;
            let (_watcher, mut events) = FileWatcher::start(&paths, filter).await?;

            tracing::info!("watching {} directories; ctrl-c to stop", paths.len());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("shutting down");
                        cancel.cancel();
                        break;
                    }
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match tracker.resolve(&event).await {
                            Ok(Some(resolved)) => {
                                if let Err(err) = scheduler.submit(resolved) {
                                    tracing::warn!(%err, "event dropped");
                                }
                            }
                            Ok(None) => scheduler.recorder().record_skipped(),
                            Err(err) => {
                                tracing::warn!(path = %event.path.display(), %err, "resolution failed");
                            }
                        }
                    }
                }
            }

            let stats = scheduler.stats();
            scheduler.shutdown().await;
            println!(
                "processed: {} pdf, {} text, {} image, {} audio, {} video ({} skipped, {} errors)",
                stats.pdf_count,
                stats.text_count,
                stats.image_count,
                stats.audio_count,
                stats.video_count,
                stats.skipped_count,
                stats.error_count
            );
        }

        Commands::Status => {
            // Status only needs the store; no model runtime required.
            let store = Store::open(&settings).await?;
            let stats = store.stats().await?;

            println!("Documents: {}", stats.total_documents);
            for (media, count) in &stats.by_media_type {
                println!("  {media}: {count}");
            }
            println!("Chunks: {}", stats.total_chunks);
            println!("Vectors: {}", store.vectors().chunk_count());
            match &stats.last_indexed_at {
                Some(ts) => println!("Last indexed: {}", ts.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last indexed: never"),
            }
        }

        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| settings.api_host.clone());
            let port = port.unwrap_or(settings.api_port);

            let ctx = Arc::new(CoreContext::init(settings).await?);
            let degraded = Arc::new(AtomicBool::new(false));
            local_doc_search::server::run_server(ctx, degraded, &host, port).await?;
        }
    }

    Ok(())
}
