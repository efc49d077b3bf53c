//! Embedding gateway over the local Ollama runtime.
//!
//! The [`Embedder`] trait is the narrow interface the rest of the core
//! sees; [`OllamaEmbedder`] is the production implementation. Dimensions
//! are fixed by a probe call at construction and any later drift is fatal
//! ([`Error::ModelShapeMismatch`]), because stored vectors would silently
//! stop being comparable.
//!
//! Texts longer than the model context are truncated on a character
//! boundary. Transient failures retry with jittered exponential backoff.
//! Results are cached in a byte-capped LRU keyed by SHA-256 of the text,
//! persisted as a segment file under `${DATA_DIR}/cache/` so restarts
//! keep warm entries.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hash::text_hash;

/// Model context window in tokens; texts are truncated to fit.
const MAX_CONTEXT_TOKENS: usize = 8192;
/// Rough chars-per-token ratio used for truncation.
const CHARS_PER_TOKEN: usize = 4;
/// Maximum texts per gateway batch.
pub const MAX_BATCH: usize = 32;
/// Maximum in-flight embedding requests.
const MAX_IN_FLIGHT: usize = 32;
const RETRIES: u32 = 3;

/// Narrow embedding interface consumed by the scheduler, the search
/// engine, and the reranker.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fixed output dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| Error::Other("empty embedding response".into()))
    }
}

/// Production embedder talking to `POST {OLLAMA_HOST}/api/embeddings`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    host: String,
    model: String,
    dims: usize,
    semaphore: Semaphore,
    cache: Mutex<EmbedCache>,
}

impl OllamaEmbedder {
    /// Connect and probe the model once to fix the dimensionality.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.embed_timeout_secs))
            .build()
            .map_err(|e| Error::Other(e.to_string()))?;

        let probe = request_embedding(
            &client,
            &settings.ollama_host,
            &settings.embedding_model,
            "dimension probe",
        )
        .await?;
        let dims = probe.len();
        if dims == 0 {
            return Err(Error::ModelShapeMismatch {
                expected: 1,
                actual: 0,
            });
        }

        let cache_path = settings.cache_dir().join("embeddings.seg");
        let cache = EmbedCache::load(
            &cache_path,
            dims,
            settings.embed_cache_mb * 1024 * 1024,
        );

        tracing::info!(model = %settings.embedding_model, dims, "embedding model ready");

        Ok(Self {
            client,
            host: settings.ollama_host.clone(),
            model: settings.embedding_model.clone(),
            dims,
            semaphore: Semaphore::new(MAX_IN_FLIGHT),
            cache: Mutex::new(cache),
        })
    }

    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let mut last_err = None;
        for attempt in 0..RETRIES {
            if attempt > 0 {
                let base = 500u64 * (1 << (attempt - 1));
                let jitter = rand::thread_rng().gen_range(0..250u64);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }

            match request_embedding(&self.client, &self.host, &self.model, text).await {
                Ok(vec) => {
                    drop(permit);
                    if vec.len() != self.dims {
                        return Err(Error::ModelShapeMismatch {
                            expected: self.dims,
                            actual: vec.len(),
                        });
                    }
                    return Ok(vec);
                }
                Err(err) if err.is_retryable() => last_err = Some(err),
                Err(err) => {
                    drop(permit);
                    return Err(err);
                }
            }
        }

        drop(permit);
        Err(last_err.unwrap_or_else(|| Error::Other("embedding failed after retries".into())))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(MAX_BATCH) {
            for text in batch {
                let truncated = truncate_chars(text, MAX_CONTEXT_TOKENS * CHARS_PER_TOKEN);
                let key = text_hash(truncated);

                if let Some(hit) = self.cache.lock().get(&key) {
                    out.push(hit);
                    continue;
                }

                let vec = self.embed_uncached(truncated).await?;
                self.cache.lock().put(key, vec.clone());
                out.push(vec);
            }
        }

        Ok(out)
    }
}

async fn request_embedding(
    client: &reqwest::Client,
    host: &str,
    model: &str,
    text: &str,
) -> Result<Vec<f32>> {
    let body = serde_json::json!({ "model": model, "prompt": text });

    let resp = client
        .post(format!("{host}/api/embeddings"))
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::ModelTimeout { seconds: 30 }
            } else {
                Error::ModelUnavailable {
                    host: host.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(Error::ModelUnavailable {
            host: host.to_string(),
            message: format!("{status}: {message}"),
        });
    }

    let json: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| Error::Other(format!("bad embedding response: {e}")))?;
    let embedding = json
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::Other("embedding response missing 'embedding'".into()))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Cut a string to at most `max_chars` characters without splitting a
/// code point.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Byte-capped LRU keyed by SHA-256 of the embedded text, write-through
/// to a segment file so warm entries survive restarts.
struct EmbedCache {
    map: HashMap<[u8; 32], Vec<f32>>,
    order: VecDeque<[u8; 32]>,
    bytes: usize,
    cap_bytes: usize,
    dims: usize,
    segment_path: PathBuf,
}

impl EmbedCache {
    const ENTRY_HEADER: usize = 32;

    fn load(segment_path: &Path, dims: usize, cap_bytes: usize) -> Self {
        let mut cache = Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            bytes: 0,
            cap_bytes,
            dims,
            segment_path: segment_path.to_path_buf(),
        };

        if let Ok(mut file) = std::fs::File::open(segment_path) {
            let mut raw = Vec::new();
            if file.read_to_end(&mut raw).is_ok() {
                let record = Self::ENTRY_HEADER + dims * 4;
                if record > 0 && raw.len() % record == 0 {
                    for chunk in raw.chunks_exact(record) {
                        let mut key = [0u8; 32];
                        key.copy_from_slice(&chunk[..32]);
                        let vec: Vec<f32> = chunk[32..]
                            .chunks_exact(4)
                            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                            .collect();
                        cache.insert_memory(key, vec);
                    }
                } else {
                    // Dims changed or the file is torn; start over.
                    let _ = std::fs::remove_file(segment_path);
                }
            }
        }

        cache
    }

    fn entry_bytes(&self) -> usize {
        Self::ENTRY_HEADER + self.dims * 4
    }

    fn get(&mut self, key: &[u8; 32]) -> Option<Vec<f32>> {
        let hit = self.map.get(key).cloned();
        if hit.is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
                self.order.push_back(*key);
            }
        }
        hit
    }

    fn insert_memory(&mut self, key: [u8; 32], vec: Vec<f32>) {
        if self.map.insert(key, vec).is_none() {
            self.order.push_back(key);
            self.bytes += self.entry_bytes();
        }
        while self.bytes > self.cap_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
            self.bytes -= self.entry_bytes();
        }
    }

    fn put(&mut self, key: [u8; 32], vec: Vec<f32>) {
        if self.map.contains_key(&key) {
            return;
        }
        self.append_segment(&key, &vec);
        self.insert_memory(key, vec);
    }

    fn append_segment(&mut self, key: &[u8; 32], vec: &[f32]) {
        // When the segment outgrows the cap, rewrite it from the live map
        // instead of growing forever.
        let on_disk = std::fs::metadata(&self.segment_path)
            .map(|m| m.len() as usize)
            .unwrap_or(0);
        if on_disk + self.entry_bytes() > self.cap_bytes {
            let _ = std::fs::remove_file(&self.segment_path);
            if let Ok(mut file) = std::fs::File::create(&self.segment_path) {
                for (k, v) in &self.map {
                    let _ = write_entry(&mut file, k, v);
                }
            }
        }

        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.segment_path)
        {
            let _ = write_entry(&mut file, key, vec);
        }
    }
}

fn write_entry(file: &mut std::fs::File, key: &[u8; 32], vec: &[f32]) -> std::io::Result<()> {
    file.write_all(key)?;
    let mut buf = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    file.write_all(&buf)
}
