//! Optional second-stage reranking.
//!
//! Scores each candidate by embedding cosine similarity against the
//! query (mapped from [-1, 1] to [0, 1]) and blends it with the fusion
//! score. The embedding cache makes repeat queries cheap.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::search::SearchResult;
use crate::vectors::cosine_similarity;

/// How many fused candidates are rescored.
pub const TOP_K_RERANK: usize = 50;
/// Blend weights: the rescored signal dominates.
pub const ORIGINAL_WEIGHT: f64 = 0.3;
pub const RERANK_WEIGHT: f64 = 0.7;

pub struct Reranker {
    embedder: Arc<dyn Embedder>,
}

impl Reranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Replace each result's score with the blended value; the caller
    /// re-sorts.
    pub async fn rescore(&self, query: &str, results: &mut [SearchResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let query_vec = self.embedder.embed_one(query).await?;
        let texts: Vec<String> = results.iter().map(|r| r.text.clone()).collect();
        let text_vecs = self.embedder.embed_batch(&texts).await?;

        for (result, text_vec) in results.iter_mut().zip(text_vecs.iter()) {
            let similarity = cosine_similarity(&query_vec, text_vec);
            let rerank_score = ((similarity + 1.0) / 2.0) as f64;
            result.score = ORIGINAL_WEIGHT * result.score + RERANK_WEIGHT * rerank_score;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_maps_similarity_into_unit_range() {
        // similarity 1.0 → rerank 1.0; similarity -1.0 → rerank 0.0
        let high = ORIGINAL_WEIGHT * 0.01 + RERANK_WEIGHT * 1.0;
        let low = ORIGINAL_WEIGHT * 0.01 + RERANK_WEIGHT * 0.0;
        assert!(high > low);
        assert!(high <= 1.0);
        assert!(low >= 0.0);
    }
}
