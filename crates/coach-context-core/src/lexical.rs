//! Keyword overlap scoring.
//!
//! Embeddings blur exact names (a supplement, a drug, a lift). The lexical
//! score catches those: the fraction of distinct query terms that appear
//! in the chunk text or its source title.

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from",
    "how", "i", "if", "in", "is", "it", "me", "my", "of", "on", "or", "should", "so", "that",
    "the", "their", "this", "to", "was", "what", "when", "which", "who", "why", "will", "with",
    "you", "your",
];

/// Lowercased alphanumeric terms of two or more characters, minus stopwords.
pub fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Shared-term ratio of `query_terms` against a chunk and its title, in `[0, 1]`.
///
/// Returns `0.0` when the query has no scoreable terms.
pub fn lexical_score(query_terms: &BTreeSet<String>, text: &str, title: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let mut doc_terms = terms(text);
    doc_terms.extend(terms(title));
    let shared = query_terms.intersection(&doc_terms).count();
    shared as f64 / query_terms.len() as f64
}
