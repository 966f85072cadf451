//! Deterministic tokenizer for the sparse (keyword) channel.

use std::collections::HashSet;

/// Upper bound on sparse terms stored per entry.
pub const MAX_SPARSE_TERMS: usize = 4096;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on",
    "or", "our", "she", "so", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "was", "we", "were", "what", "when", "which", "who", "will", "with", "you",
    "your",
];

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

/// Unique terms in first-seen order, capped at [`MAX_SPARSE_TERMS`].
pub fn sparse_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for term in tokens(text) {
        if out.len() >= MAX_SPARSE_TERMS {
            break;
        }
        if seen.insert(term.clone()) {
            out.push(term);
        }
    }
    out
}

/// Terms for a query; same normalization as indexed text.
pub fn query_terms(query: &str) -> Vec<String> {
    sparse_terms(query)
}
