//! Duplicate-continuation detection.
//!
//! Prompts are compared as bags of lowercase alphanumeric tokens using the
//! Jaccard ratio. Everything here is pure and deterministic.

use std::collections::BTreeSet;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard ratio of the two token sets. Two empty prompts count as identical.
pub fn similarity(left: &str, right: &str) -> f64 {
    let left = tokenize(left);
    let right = tokenize(right);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    shared as f64 / union as f64
}

/// True when any prior prompt scores strictly above `threshold`.
pub fn is_too_similar<S: AsRef<str>>(candidate: &str, prior_prompts: &[S], threshold: f64) -> bool {
    prior_prompts
        .iter()
        .any(|prior| similarity(candidate, prior.as_ref()) > threshold)
}

/// Index and score of the closest prior prompt.
pub fn closest_match<S: AsRef<str>>(candidate: &str, prior_prompts: &[S]) -> Option<(usize, f64)> {
    prior_prompts
        .iter()
        .enumerate()
        .map(|(idx, prior)| (idx, similarity(candidate, prior.as_ref())))
        .fold(None, |best, (idx, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((idx, score)),
        })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityGuard {
    threshold: f64,
}

impl Default for SimilarityGuard {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl SimilarityGuard {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_too_similar<S: AsRef<str>>(&self, candidate: &str, prior_prompts: &[S]) -> bool {
        is_too_similar(candidate, prior_prompts, self.threshold)
    }
}
