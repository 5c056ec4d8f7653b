use std::cmp::Ordering;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::models::RetrievalExample;

/// Width of the hashed feature space used for snippet embeddings.
pub(crate) const EMBEDDING_DIM: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ContextSnippet {
    pub(crate) id: String,
    pub(crate) language: Option<String>,
    pub(crate) code: String,
    pub(crate) similarity: f32,
}

#[derive(Debug)]
struct IndexedExample {
    id: String,
    language: Option<String>,
    code: String,
    vector: Vec<f32>,
}

/// In-memory similarity index over one theme's reference examples.
#[derive(Debug)]
pub(crate) struct ThemeIndex {
    theme: String,
    entries: Vec<IndexedExample>,
    fingerprint: String,
}

impl ThemeIndex {
    pub(crate) fn build(theme: &str, examples: Vec<RetrievalExample>) -> Self {
        let mut entries = examples
            .into_iter()
            .map(|example| {
                let vector = match example.embedding {
                    Some(embedding) if embedding.0.len() == EMBEDDING_DIM => {
                        normalized(embedding.0)
                    }
                    _ => embed(&example.code),
                };
                IndexedExample {
                    id: example.id,
                    language: example.language,
                    code: example.code,
                    vector,
                }
            })
            .collect::<Vec<_>>();
        entries.sort_by(|left, right| left.id.cmp(&right.id));

        let fingerprint = fingerprint(&entries);
        Self { theme: theme.to_string(), entries, fingerprint }
    }

    pub(crate) fn theme(&self) -> &str {
        &self.theme
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, example_id: &str) -> bool {
        self.entries.binary_search_by(|entry| entry.id.as_str().cmp(example_id)).is_ok()
    }

    /// Top `k` examples by cosine similarity to `submission`, ties by id.
    pub(crate) fn query(&self, submission: &str, k: usize) -> Vec<ContextSnippet> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }

        let probe = embed(submission);
        let mut scored = self
            .entries
            .iter()
            .map(|entry| (dot(&probe, &entry.vector), entry))
            .collect::<Vec<_>>();
        scored.sort_by(|(left_score, left), (right_score, right)| {
            match right_score.total_cmp(left_score) {
                Ordering::Equal => left.id.cmp(&right.id),
                other => other,
            }
        });

        scored
            .into_iter()
            .take(k)
            .map(|(similarity, entry)| ContextSnippet {
                id: entry.id.clone(),
                language: entry.language.clone(),
                code: entry.code.clone(),
                similarity,
            })
            .collect()
    }
}

/// Hashed bag of lower-cased identifier tokens and token bigrams, L2-normalised.
pub(crate) fn embed(text: &str) -> Vec<f32> {
    let tokens = tokenize(text);
    let mut vector = vec![0.0_f32; EMBEDDING_DIM];

    for token in &tokens {
        vector[bucket(token)] += 1.0;
    }
    for pair in tokens.windows(2) {
        vector[bucket(&format!("{} {}", pair[0], pair[1]))] += 1.0;
    }

    normalized(vector)
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

fn bucket(feature: &str) -> usize {
    let digest = Sha256::digest(feature.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % EMBEDDING_DIM as u64) as usize
}

fn normalized(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.iter_mut().for_each(|value| *value /= norm);
    }
    vector
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

fn fingerprint(entries: &[IndexedExample]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.id.as_bytes());
        hasher.update([0]);
        hasher.update(entry.code.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}
