//! Feature-hashing TF-IDF embedder
//!
//! In-process, deterministic, no model files. Good enough for keyword-ish
//! semantic matching and for environments where neither the ONNX model nor
//! a remote API is available.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::embedding::EmbeddingProvider;
use crate::error::Result;

/// TF-IDF embedder using the hashing trick with signed features
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    /// Tokenize text into lowercase alphanumeric words
    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.len() > 1)
            .map(String::from)
            .collect()
    }

    fn hash_feature(parts: &[&str], dimension: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for part in parts {
            part.hash(&mut hasher);
        }
        (hasher.finish() as usize) % dimension
    }

    /// Sign for feature hashing; reduces collision impact
    fn hash_sign(parts: &[&str]) -> f32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for part in parts {
            part.hash(&mut hasher);
        }
        "_sign".hash(&mut hasher);
        if hasher.finish() % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }
}

impl EmbeddingProvider for HashedEmbedder {
    fn model_name(&self) -> &str {
        "hashed-tfidf"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = Self::tokenize(text);
        let mut embedding = vec![0.0_f32; self.dimension];

        if tokens.is_empty() {
            return Ok(embedding);
        }

        let doc_len = tokens.len() as f32;

        // Bigrams first, weighted lower than unigrams
        for window in tokens.windows(2) {
            let parts = [window[0].as_str(), "_", window[1].as_str()];
            let idx = Self::hash_feature(&parts, self.dimension);
            embedding[idx] += 0.5 * Self::hash_sign(&parts);
        }

        let mut tf: HashMap<String, f32> = HashMap::new();
        for token in tokens {
            *tf.entry(token).or_insert(0.0) += 1.0;
        }

        for (token, count) in tf {
            let tf_score = (1.0 + count / doc_len).ln();
            // IDF approximation: longer tokens tend to be rarer
            let idf_score = 1.0 + (token.len() as f32 * 0.1);
            let weight = tf_score * idf_score;

            let parts = [token.as_str()];
            let idx = Self::hash_feature(&parts, self.dimension);
            embedding[idx] += weight * Self::hash_sign(&parts);
        }

        // L2 normalize
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }

        Ok(embedding)
    }
}
