//! Similarity signals between a candidate name and a product master.
//!
//! * Lexical: trigram Jaccard similarity over normalised names, the same
//!   measure `pg_trgm` uses, so a database-backed catalog can prefilter with
//!   an index and score identically.
//! * Semantic: cosine similarity between embeddings, when an
//!   [`EmbeddingSignal`] is configured and the master carries an embedding.
//!   This is what lets `"Pienas 1L"` meet `"Milk 1L"`.

use crate::config::MatchingConfig;
use crate::error::ExtractionError;
use async_trait::async_trait;
use std::collections::HashSet;

/// Produces embeddings for product names.
#[async_trait]
pub trait EmbeddingSignal: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExtractionError>;
}

/// Word trigrams with two leading and one trailing space of padding.
fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let mut out = HashSet::new();
    for word in s.split_whitespace() {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        for w in padded.windows(3) {
            out.insert([w[0], w[1], w[2]]);
        }
    }
    out
}

/// Trigram Jaccard similarity in `[0, 1]`. Empty input scores 0.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

/// Cosine similarity clamped to `[0, 1]`, or `None` when the vectors are
/// not comparable.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    let cos = dot / (na.sqrt() * nb.sqrt());
    cos.is_finite().then(|| cos.clamp(0.0, 1.0))
}

/// Weighted maximum of the available signals, clamped to `[0, 1]`.
///
/// A maximum rather than a sum: a strong semantic hit across languages must
/// not be dragged down by a near-zero lexical score.
pub fn combined_score(lexical: f64, semantic: Option<f64>, config: &MatchingConfig) -> f64 {
    let lex = lexical * config.lexical_weight;
    let sem = semantic.map_or(0.0, |s| s * config.semantic_weight);
    lex.max(sem).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_score_one() {
        assert_eq!(trigram_similarity("pienas 1l", "pienas 1l"), 1.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(trigram_similarity("pienas 1l", "duona") < 0.1);
        assert_eq!(trigram_similarity("", "duona"), 0.0);
    }

    #[test]
    fn similar_names_score_between() {
        let s = trigram_similarity("pienas 2.5 1l", "pienas 3.2 1l");
        assert!(s > 0.3 && s < 1.0, "got {s}");
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = trigram_similarity("kefyras 1.5l", "kefyras 1l");
        let b = trigram_similarity("kefyras 1l", "kefyras 1.5l");
        assert_eq!(a, b);
    }

    #[test]
    fn cosine_edges() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
    }

    #[test]
    fn combined_is_weighted_max() {
        let config = MatchingConfig::default();
        assert_eq!(combined_score(0.1, Some(0.92), &config), 0.92);
        assert_eq!(combined_score(0.7, None, &config), 0.7);

        let config = MatchingConfig {
            semantic_weight: 0.5,
            ..Default::default()
        };
        assert_eq!(combined_score(0.1, Some(0.92), &config), 0.46);
    }
}
