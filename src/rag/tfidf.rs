//! Lightweight TF-IDF vectorization.
//!
//! Backs the keyword tiers of the classification cache and the answer
//! cache: fit over the cached query corpus, transform lookups, match by
//! cosine. Vocabulary is capped to the most frequent n-grams so transforms
//! stay cheap at the request path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Common English stopwords removed before n-gram extraction.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on",
    "or", "our", "she", "so", "that", "the", "their", "them", "there", "they", "this", "to", "was",
    "we", "were", "what", "when", "where", "which", "who", "will", "with", "you", "your",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !is_stopword(t))
        .map(String::from)
        .collect()
}

fn ngrams(tokens: &[String], max_n: usize) -> Vec<String> {
    let mut terms = Vec::new();
    for n in 1..=max_n {
        if tokens.len() < n {
            break;
        }
        for window in tokens.windows(n) {
            terms.push(window.join(" "));
        }
    }
    terms
}

/// TF-IDF vectorizer with an n-gram range of `1..=ngram_max` and a
/// vocabulary capped at `max_features` terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    max_features: usize,
    ngram_max: usize,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    num_docs: usize,
}

impl TfidfVectorizer {
    /// Create an unfitted vectorizer.
    pub fn new(max_features: usize, ngram_max: usize) -> Self {
        Self {
            max_features,
            ngram_max,
            vocabulary: HashMap::new(),
            idf: Vec::new(),
            num_docs: 0,
        }
    }

    /// Whether `fit` has been called with a non-empty corpus.
    pub fn is_fitted(&self) -> bool {
        !self.vocabulary.is_empty()
    }

    /// Fit the vocabulary and IDF weights over a corpus.
    pub fn fit(&mut self, corpus: &[String]) {
        self.vocabulary.clear();
        self.idf.clear();
        self.num_docs = corpus.len();
        if corpus.is_empty() {
            return;
        }

        // Document frequency per term.
        let mut df: HashMap<String, usize> = HashMap::new();
        for doc in corpus {
            let tokens = tokenize(doc);
            let mut seen: Vec<String> = ngrams(&tokens, self.ngram_max);
            seen.sort();
            seen.dedup();
            for term in seen {
                *df.entry(term).or_insert(0) += 1;
            }
        }

        // Keep the most frequent terms; ties broken lexicographically so
        // fits are deterministic.
        let mut ranked: Vec<(String, usize)> = df.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.max_features);

        let n = corpus.len() as f32;
        for (slot, (term, term_df)) in ranked.into_iter().enumerate() {
            // Smoothed IDF, never negative.
            let idf = ((1.0 + n) / (1.0 + term_df as f32)).ln() + 1.0;
            self.vocabulary.insert(term, slot);
            self.idf.push(idf);
        }
    }

    /// Transform text into an L2-normalized dense TF-IDF vector.
    pub fn transform(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.vocabulary.len()];
        if vector.is_empty() {
            return vector;
        }

        let tokens = tokenize(text);
        for term in ngrams(&tokens, self.ngram_max) {
            if let Some(&slot) = self.vocabulary.get(&term) {
                vector[slot] += self.idf[slot];
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    /// Cosine similarity of two transformed vectors.
    pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }
}
