//! Hybrid retrieval: dense vector search and BM25 fused with Reciprocal
//! Rank Fusion.
//!
//! Both searches run from the same request with doc-level filters pushed
//! down, over-fetching `4·k` candidates each. Fusion scores each chunk
//! `w_v/(K+rank_v) + w_b/(K+rank_b)` with a missing list contributing
//! nothing; vector-only hits below the similarity floor are dropped.
//! Ordering is deterministic: RRF score, then cosine similarity, then
//! the lexicographically smaller chunk id.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::MediaType;
use crate::rerank::{Reranker, TOP_K_RERANK};
use crate::store::SearchFilters;
use crate::CoreContext;

/// RRF constant.
pub const RRF_K: f64 = 60.0;
/// Weight of the dense ranking in fusion.
pub const VECTOR_WEIGHT: f64 = 0.7;
/// Weight of the lexical ranking in fusion.
pub const BM25_WEIGHT: f64 = 0.3;
/// Vector-only hits under this cosine similarity are dropped.
pub const MIN_SIMILARITY: f32 = 0.3;
/// Each index is asked for `OVERSAMPLE · k` candidates before fusion.
pub const OVERSAMPLE: usize = 4;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    pub filters: SearchFilters,
    pub rerank: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_LIMIT,
            filters: SearchFilters::default(),
            rerank: false,
        }
    }
}

/// One ranked result, enriched with document metadata and locators.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub path: String,
    pub filename: String,
    pub media_type: MediaType,
    pub score: f64,
    pub vector_score: Option<f32>,
    pub bm25_score: Option<f64>,
    pub page: Option<i64>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// `file://{path}#t={floor(start_time)}` for audio/video chunks.
    pub playback_url: Option<String>,
}

#[derive(Default)]
struct FusedCandidate {
    vector_rank: Option<usize>,
    vector_score: Option<f32>,
    bm25_rank: Option<usize>,
    bm25_score: Option<f64>,
}

impl FusedCandidate {
    fn rrf_score(&self) -> f64 {
        let mut score = 0.0;
        if let Some(rank) = self.vector_rank {
            score += VECTOR_WEIGHT / (RRF_K + rank as f64);
        }
        if let Some(rank) = self.bm25_rank {
            score += BM25_WEIGHT / (RRF_K + rank as f64);
        }
        score
    }
}

/// Run a hybrid search. The query is embedded once; the two index scans
/// run concurrently; fused candidates are enriched from the document
/// registry and optionally reranked.
pub async fn search(ctx: &CoreContext, request: &SearchRequest) -> Result<Vec<SearchResult>> {
    let query = request.query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let limit = request.limit.clamp(1, MAX_LIMIT);
    let fetch = limit * OVERSAMPLE;

    let query_vec = ctx.embedder.embed_one(query).await?;
    let allowed_docs = ctx.store.filtered_doc_ids(&request.filters).await?;

    let (vector_hits, bm25_hits) = tokio::join!(
        async {
            ctx.store
                .vectors()
                .search(&query_vec, fetch, allowed_docs.as_ref())
        },
        ctx.store.bm25_search(query, fetch as i64, &request.filters),
    );
    let bm25_hits = bm25_hits?;

    // Fuse by chunk id, remembering each list's rank (1-based).
    let mut fused: HashMap<Uuid, FusedCandidate> = HashMap::new();
    for (i, hit) in vector_hits.iter().enumerate() {
        let entry = fused.entry(hit.chunk_id).or_default();
        entry.vector_rank = Some(i + 1);
        entry.vector_score = Some(hit.score);
    }
    for (i, hit) in bm25_hits.iter().enumerate() {
        let entry = fused.entry(hit.chunk_id).or_default();
        entry.bm25_rank = Some(i + 1);
        entry.bm25_score = Some(hit.score);
    }

    // A weak dense match with no lexical support is noise.
    fused.retain(|_, c| {
        c.bm25_rank.is_some() || c.vector_score.unwrap_or(0.0) >= MIN_SIMILARITY
    });

    let mut ranked: Vec<(Uuid, f64, Option<f32>)> = fused
        .iter()
        .map(|(id, c)| (*id, c.rrf_score(), c.vector_score))
        .collect();
    sort_ranked(&mut ranked);

    let candidate_count = if request.rerank {
        limit.max(TOP_K_RERANK)
    } else {
        limit
    };
    ranked.truncate(candidate_count);

    let ids: Vec<Uuid> = ranked.iter().map(|(id, _, _)| *id).collect();
    let enriched = ctx.store.enrich_chunks(&ids).await?;

    let mut results = Vec::with_capacity(ranked.len());
    for (chunk_id, score, _) in &ranked {
        let Some(row) = enriched.get(chunk_id) else {
            // The chunk vanished between fusion and enrichment (a write
            // landed in between); skip rather than return a ghost.
            continue;
        };
        if row.is_deleted {
            continue;
        }
        let candidate = &fused[chunk_id];

        let playback_url = match (row.media_type, row.chunk.start_time) {
            (MediaType::Audio | MediaType::Video, Some(start)) => {
                Some(format!("file://{}#t={}", row.path, start.floor() as i64))
            }
            _ => None,
        };

        results.push(SearchResult {
            chunk_id: *chunk_id,
            document_id: row.chunk.document_id,
            text: row.chunk.text.clone(),
            path: row.path.clone(),
            filename: row.filename.clone(),
            media_type: row.media_type,
            score: *score,
            vector_score: candidate.vector_score,
            bm25_score: candidate.bm25_score,
            page: row.chunk.page,
            start_time: row.chunk.start_time,
            end_time: row.chunk.end_time,
            playback_url,
        });
    }

    if request.rerank && !results.is_empty() {
        let reranker = Reranker::new(ctx.embedder.clone());
        reranker.rescore(query, &mut results).await?;
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
    }

    results.truncate(limit);
    Ok(results)
}

/// Deterministic ordering: RRF score desc, cosine desc (missing loses),
/// then chunk id asc.
fn sort_ranked(ranked: &mut [(Uuid, f64, Option<f32>)]) {
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let sim_a = a.2.unwrap_or(f32::NEG_INFINITY);
                let sim_b = b.2.unwrap_or(f32::NEG_INFINITY);
                sim_b.partial_cmp(&sim_a).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.0.cmp(&b.0))
    });
}

/// Validate a user-supplied limit into the allowed range.
pub fn clamp_limit(limit: Option<usize>) -> Result<usize> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(k) if (1..=MAX_LIMIT).contains(&k) => Ok(k),
        Some(k) => Err(Error::ConfigInvalid(format!(
            "limit must be in [1, {MAX_LIMIT}], got {k}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_weights_follow_ranks() {
        let both_first = FusedCandidate {
            vector_rank: Some(1),
            vector_score: Some(0.9),
            bm25_rank: Some(1),
            bm25_score: Some(5.0),
        };
        let vector_only = FusedCandidate {
            vector_rank: Some(1),
            vector_score: Some(0.9),
            ..Default::default()
        };
        let bm25_only = FusedCandidate {
            bm25_rank: Some(1),
            bm25_score: Some(5.0),
            ..Default::default()
        };

        let expected_both = VECTOR_WEIGHT / 61.0 + BM25_WEIGHT / 61.0;
        assert!((both_first.rrf_score() - expected_both).abs() < 1e-12);
        assert!(both_first.rrf_score() > vector_only.rrf_score());
        assert!(vector_only.rrf_score() > bm25_only.rrf_score());
    }

    #[test]
    fn missing_list_contributes_nothing() {
        let c = FusedCandidate::default();
        assert_eq!(c.rrf_score(), 0.0);
    }

    #[test]
    fn ordering_breaks_ties_deterministically() {
        let id_small = Uuid::from_u128(1);
        let id_large = Uuid::from_u128(2);

        // Equal RRF, higher cosine wins.
        let mut ranked = vec![
            (id_large, 0.5, Some(0.4f32)),
            (id_small, 0.5, Some(0.9f32)),
        ];
        sort_ranked(&mut ranked);
        assert_eq!(ranked[0].0, id_small);

        // Equal everything: smaller chunk id first.
        let mut ranked = vec![(id_large, 0.5, Some(0.4)), (id_small, 0.5, Some(0.4))];
        sort_ranked(&mut ranked);
        assert_eq!(ranked[0].0, id_small);

        // Missing cosine loses the tie.
        let mut ranked = vec![(id_small, 0.5, None), (id_large, 0.5, Some(0.1))];
        sort_ranked(&mut ranked);
        assert_eq!(ranked[0].0, id_large);
    }

    #[test]
    fn limit_clamping() {
        assert_eq!(clamp_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(1)).unwrap(), 1);
        assert_eq!(clamp_limit(Some(100)).unwrap(), 100);
        assert!(clamp_limit(Some(0)).is_err());
        assert!(clamp_limit(Some(101)).is_err());
    }
}
