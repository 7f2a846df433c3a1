//! Token-overlap similarity for prompts.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Default threshold for similarity-based cache lookups.
pub const DEFAULT_CACHE_THRESHOLD: f64 = 0.85;
/// Default threshold for grouping queued requests into one batch.
pub const DEFAULT_GROUPING_THRESHOLD: f64 = 0.6;

/// Lowercased whitespace-separated tokens.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

/// Jaccard similarity of the token sets of `a` and `b`, in `[0, 1]`.
/// Zero when either side has no tokens.
pub fn similarity(a: &str, b: &str) -> f64 {
    jaccard(&tokenize(a), &tokenize(b))
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    pub index: usize,
    pub score: f64,
}

/// Best candidate scoring at or above `threshold`.
///
/// Candidates are `(text, last_accessed)` pairs. Equal scores go to the most
/// recently accessed candidate. A threshold of zero or less disables matching.
pub fn best_match<'a, I>(query: &str, candidates: I, threshold: f64) -> Option<SimilarityMatch>
where
    I: IntoIterator<Item = (&'a str, DateTime<Utc>)>,
{
    if threshold <= 0.0 {
        return None;
    }
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return None;
    }
    let mut best: Option<(SimilarityMatch, DateTime<Utc>)> = None;
    for (index, (text, accessed)) in candidates.into_iter().enumerate() {
        let score = jaccard(&query_tokens, &tokenize(text));
        if score < threshold {
            continue;
        }
        let better = match &best {
            None => true,
            Some((current, current_accessed)) => match score.partial_cmp(&current.score) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => accessed > *current_accessed,
                _ => false,
            },
        };
        if better {
            best = Some((SimilarityMatch { index, score }, accessed));
        }
    }
    best.map(|(m, _)| m)
}
