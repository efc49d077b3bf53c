//! Environment-driven configuration.
//!
//! All settings come from environment variables with sensible defaults,
//! validated once at startup. The data directory layout is:
//!
//! ```text
//! ${DATA_DIR}/
//!   docs.db      relational store + FTS5 index
//!   vectors/     on-disk vector index, one file per document
//!   cache/       embedding cache segments
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the Ollama-compatible model runtime.
    pub ollama_host: String,
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    /// Log level filter (`error`..`trace`).
    pub log_level: String,

    /// Embedding model name.
    pub embedding_model: String,
    /// VLM used for image description and OCR.
    pub vlm_model: String,
    /// Whisper model passed to the transcriber subprocess.
    pub whisper_model: String,

    // PDF pipeline
    pub pdf_vlm_model: String,
    pub pdf_vlm_timeout_secs: u64,
    pub pdf_vlm_dpi: u32,
    pub pdf_vlm_max_pages: usize,
    pub pdf_vlm_workers: usize,
    pub pdf_min_chars_per_page: usize,

    // Chunking
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Embedding gateway
    pub embed_batch_size: usize,
    pub embed_timeout_secs: u64,
    pub embed_cache_mb: usize,

    // Scheduler
    pub workers: usize,

    // HTTP API
    pub api_host: String,
    pub api_port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::ConfigInvalid(format!("{key} has invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Load settings from the environment and validate them.
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var("DATA_DIR") {
            Ok(raw) => expand_home(Path::new(&raw)),
            Err(_) => dirs::data_dir()
                .map(|d| d.join("local-doc-search"))
                .unwrap_or_else(|| PathBuf::from(".local-doc-search")),
        };

        let settings = Self {
            ollama_host: env_or("OLLAMA_HOST", "http://localhost:11434"),
            data_dir,
            log_level: env_or("LOG_LEVEL", "info"),
            embedding_model: env_or("EMBEDDING_MODEL", "bge-m3"),
            vlm_model: env_or("VLM_MODEL", "llava:7b"),
            whisper_model: env_or("WHISPER_MODEL", "large-v3-turbo"),
            pdf_vlm_model: env_or("PDF_VLM_MODEL", "minicpm-v"),
            pdf_vlm_timeout_secs: env_parse("PDF_VLM_TIMEOUT", 60)?,
            pdf_vlm_dpi: env_parse("PDF_VLM_DPI", 150)?,
            pdf_vlm_max_pages: env_parse("PDF_VLM_MAX_PAGES", 20)?,
            pdf_vlm_workers: env_parse("PDF_VLM_WORKERS", 2)?,
            pdf_min_chars_per_page: env_parse("PDF_MIN_CHARS_PER_PAGE", 100)?,
            chunk_size: env_parse("CHUNK_SIZE", 800)?,
            chunk_overlap: env_parse("CHUNK_OVERLAP", 100)?,
            embed_batch_size: env_parse("EMBED_BATCH_SIZE", 32)?,
            embed_timeout_secs: env_parse("EMBED_TIMEOUT", 30)?,
            embed_cache_mb: env_parse("EMBED_CACHE_MB", 1000)?,
            workers: env_parse("INDEX_WORKERS", 4)?,
            api_host: env_or("API_HOST", "127.0.0.1"),
            api_port: env_parse("API_PORT", 2602)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::ConfigInvalid("CHUNK_SIZE must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::ConfigInvalid(
                "CHUNK_OVERLAP must be smaller than CHUNK_SIZE".into(),
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(Error::ConfigInvalid("EMBED_BATCH_SIZE must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(Error::ConfigInvalid("INDEX_WORKERS must be > 0".into()));
        }
        if self.pdf_vlm_workers == 0 {
            return Err(Error::ConfigInvalid("PDF_VLM_WORKERS must be > 0".into()));
        }
        if !self.ollama_host.starts_with("http://") && !self.ollama_host.starts_with("https://") {
            return Err(Error::ConfigInvalid(format!(
                "OLLAMA_HOST must be an http(s) URL, got: {}",
                self.ollama_host
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("docs.db")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Create the data directory tree if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vectors_dir())?;
        std::fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
pub(crate) fn test_settings(data_dir: PathBuf) -> Settings {
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
