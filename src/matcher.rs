//! Weighted similarity scoring and top-K selection over the corpus.

use std::cmp::Ordering;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::corpus::GrantCorpus;
use crate::fields::field_weight;
use crate::profile::FieldEmbeddings;
use crate::vector::cosine_similarity;

/// Default number of matches returned to callers.
pub const DEFAULT_TOP_K: usize = 5;

/// A corpus entry annotated with its similarity to the user's query.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    /// Corpus entry identifier.
    pub id: u64,
    /// Grant display name.
    pub name: String,
    /// Weighted mean of per-field cosine similarities, in `[0, 1]` for
    /// non-negative embedding spaces.
    pub similarity: f32,
    /// Original grant record, carried through unmodified.
    pub original: Value,
}

/// Weighted mean of per-field cosine similarities between a query and a grant.
///
/// Fields the user specified but the grant lacks are skipped outright rather
/// than penalized as zero, so sparse corpus entries compete on the fields they
/// do carry. No overlapping fields at all scores `0.0` (no match signal, not
/// an error). A vector-length mismatch means the two sides were embedded under
/// different providers and fails loudly.
pub fn flexible_similarity(user: &FieldEmbeddings, grant: &FieldEmbeddings) -> Result<f32> {
    let mut total_score = 0f32;
    let mut total_weight = 0f32;
    for (field, user_vec) in user {
        let grant_vec = match grant.get(field) {
            Some(vec) => vec,
            None => continue,
        };
        let weight = field_weight(field);
        let similarity = cosine_similarity(user_vec, grant_vec)?;
        total_score += similarity * weight;
        total_weight += weight;
    }
    if total_weight > 0.0 {
        Ok(total_score / total_weight)
    } else {
        Ok(0.0)
    }
}

/// Scores every corpus entry against the query and returns the best `top_k`.
///
/// Results are sorted non-increasing by similarity; the sort is stable, so
/// ties keep corpus order. No similarity threshold is applied here; cutoffs
/// such as "only show matches above 0.6" belong to the caller.
pub fn find_top_matches(
    user: &FieldEmbeddings,
    corpus: &GrantCorpus,
    top_k: usize,
) -> Result<Vec<MatchResult>> {
    let mut matches = Vec::with_capacity(corpus.len());
    for entry in corpus.entries() {
        let similarity = flexible_similarity(user, &entry.embeddings)?;
        matches.push(MatchResult {
            id: entry.id,
            name: entry.name.clone(),
            similarity,
            original: entry.original.clone(),
        });
    }
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
    matches.truncate(top_k);
    Ok(matches)
}
