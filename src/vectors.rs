//! On-disk dense vector index with an in-memory search mirror.
//!
//! Vectors live outside the relational store, one file per document under
//! `${DATA_DIR}/vectors/`, named `{document_id}.{version}.vec`. The
//! version suffix is what makes the store's two-phase apply recoverable:
//! a new version is written beside the old one, the relational commit
//! flips the document's `vector_version`, and only then is the old file
//! deleted. After a crash the recovery pass can always tell which file is
//! committed.
//!
//! File layout: `"LDSV"` magic, `u32` dims, `u32` count, then `count`
//! records of 16-byte chunk UUID followed by `dims` little-endian `f32`s.
//!
//! Search is a flat cosine scan over the in-memory mirror. The corpus for
//! a single host fits comfortably; the file format does not change if an
//! ANN structure is layered on top later.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"LDSV";

/// A scored hit from the vector index.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub score: f32,
}

struct DocVectors {
    version: i64,
    entries: Vec<(Uuid, Vec<f32>)>,
}

pub struct VectorIndex {
    dir: PathBuf,
    docs: RwLock<HashMap<Uuid, DocVectors>>,
}

impl VectorIndex {
    /// Open the index rooted at `dir`, creating the directory if needed.
    /// The mirror starts empty; the store loads committed files during
    /// recovery.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            docs: RwLock::new(HashMap::new()),
        })
    }

    fn file_path(&self, document_id: Uuid, version: i64) -> PathBuf {
        self.dir.join(format!("{document_id}.{version}.vec"))
    }

    /// Write a new version file for a document. Phase one of the
    /// two-phase apply; the mirror is untouched until [`install`].
    ///
    /// [`install`]: VectorIndex::install
    pub fn write_file(
        &self,
        document_id: Uuid,
        version: i64,
        dims: usize,
        entries: &[(Uuid, Vec<f32>)],
    ) -> Result<()> {
        for (_, vec) in entries {
            if vec.len() != dims {
                return Err(Error::ModelShapeMismatch {
                    expected: dims,
                    actual: vec.len(),
                });
            }
        }

        let path = self.file_path(document_id, version);
        let mut buf =
            Vec::with_capacity(12 + entries.len() * (16 + dims * 4));
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(dims as u32).to_le_bytes());
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (chunk_id, vec) in entries {
            buf.extend_from_slice(chunk_id.as_bytes());
            for v in vec {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }

        let mut file = std::fs::File::create(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a version file back into entries.
    pub fn read_file(&self, document_id: Uuid, version: i64) -> Result<Vec<(Uuid, Vec<f32>)>> {
        let path = self.file_path(document_id, version);
        let mut raw = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut raw)?;

        if raw.len() < 12 || &raw[0..4] != MAGIC {
            return Err(Error::StoreCorruption(format!(
                "bad vector file header: {}",
                path.display()
            )));
        }
        let dims = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let count = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
        let record = 16 + dims * 4;
        if raw.len() != 12 + count * record {
            return Err(Error::StoreCorruption(format!(
                "truncated vector file: {}",
                path.display()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 12 + i * record;
            let id_bytes: [u8; 16] = raw[off..off + 16]
                .try_into()
                .map_err(|_| Error::StoreCorruption("vector record id".into()))?;
            let chunk_id = Uuid::from_bytes(id_bytes);
            let mut vec = Vec::with_capacity(dims);
            for d in 0..dims {
                let voff = off + 16 + d * 4;
                vec.push(f32::from_le_bytes([
                    raw[voff],
                    raw[voff + 1],
                    raw[voff + 2],
                    raw[voff + 3],
                ]));
            }
            entries.push((chunk_id, vec));
        }
        Ok(entries)
    }

    /// Delete one version file. Missing files are fine (already cleaned).
    pub fn remove_file(&self, document_id: Uuid, version: i64) {
        let path = self.file_path(document_id, version);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), %err, "failed to remove vector file");
            }
        }
    }

    /// Delete every on-disk version for a document.
    pub fn remove_doc_files(&self, document_id: Uuid) {
        for (doc, version, _) in self.scan_files() {
            if doc == document_id {
                self.remove_file(doc, version);
            }
        }
    }

    /// List `(document_id, version, path)` for every file on disk.
    pub fn scan_files(&self) -> Vec<(Uuid, i64, PathBuf)> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let Some(stem) = name.strip_suffix(".vec") else {
                continue;
            };
            let Some((doc_part, ver_part)) = stem.rsplit_once('.') else {
                continue;
            };
            if let (Ok(doc), Ok(ver)) = (Uuid::parse_str(doc_part), ver_part.parse::<i64>()) {
                out.push((doc, ver, path));
            }
        }
        out
    }

    /// Swap a document's vectors in the search mirror. Phase two of the
    /// apply, called after the relational commit.
    pub fn install(&self, document_id: Uuid, version: i64, entries: Vec<(Uuid, Vec<f32>)>) {
        self.docs
            .write()
            .insert(document_id, DocVectors { version, entries });
    }

    /// Drop a document from the search mirror (tombstone path).
    pub fn evict(&self, document_id: Uuid) {
        self.docs.write().remove(&document_id);
    }

    /// Load a committed version file into the mirror.
    pub fn load_committed(&self, document_id: Uuid, version: i64) -> Result<()> {
        if version == 0 {
            // Version 0 means the document has never had vectors applied.
            return Ok(());
        }
        let entries = self.read_file(document_id, version)?;
        self.install(document_id, version, entries);
        Ok(())
    }

    /// Number of vectors currently searchable.
    pub fn chunk_count(&self) -> usize {
        self.docs.read().values().map(|d| d.entries.len()).sum()
    }

    /// The mirror's installed version for a document, if any.
    pub fn installed_version(&self, document_id: Uuid) -> Option<i64> {
        self.docs.read().get(&document_id).map(|d| d.version)
    }

    /// Flat cosine search over the mirror. `allowed_docs` is the filter
    /// push-down: when present, only those documents participate. Ties
    /// break toward the lexicographically smaller chunk id so results are
    /// deterministic.
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
        allowed_docs: Option<&HashSet<Uuid>>,
    ) -> Vec<VectorHit> {
        let docs = self.docs.read();
        let mut hits: Vec<VectorHit> = Vec::new();

        for (doc_id, doc) in docs.iter() {
            if let Some(allowed) = allowed_docs {
                if !allowed.contains(doc_id) {
                    continue;
                }
            }
            for (chunk_id, vec) in &doc.entries {
                hits.push(VectorHit {
                    chunk_id: *chunk_id,
                    document_id: *doc_id,
                    score: cosine_similarity(query, vec),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        hits
    }
}

/// Cosine similarity in `[-1, 1]`; 0 for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
