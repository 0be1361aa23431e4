//! Embedding generation
//!
//! Supports multiple embedding providers:
//! - Feature-hashing TF-IDF (in-process, no external dependencies)
//! - OpenAI-compatible remote API
//! - Local ONNX models via `ort` (behind the `onnx` feature)
//!
//! All providers sit behind [`EmbeddingProvider`]; the engine wraps the
//! configured provider in an LRU cache and a bounded in-flight gate, and
//! exposes the bundle as [`EmbeddingHandle`] for async callers.

mod cache;
mod hashed;
#[cfg(feature = "onnx")]
mod onnx;
mod remote;

pub use cache::{EmbeddingCache, EmbeddingCacheStats};
pub use hashed::HashedEmbedder;
#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbedder;
pub use remote::RemoteEmbedder;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::EmbeddingConfig;
use crate::error::{MnemoError, Result};
use crate::identity;

/// Trait for embedding providers
///
/// All methods are synchronous — callers in async contexts should go
/// through [`EmbeddingHandle`], which runs them on the blocking pool.
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. "hashed-tfidf" or "all-MiniLM-L6-v2"
    fn model_name(&self) -> &str;

    /// Vector dimension; stable for the lifetime of the process
    fn dimension(&self) -> usize;

    /// Whether the provider can produce embeddings right now.
    ///
    /// A not-ready provider does not fail writes: records are persisted
    /// without a vector and embedded lazily once the provider recovers.
    fn ready(&self) -> bool {
        true
    }

    /// Generate an embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts; element-wise equal to
    /// calling [`Self::embed`] serially
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Create the configured provider, wrapped in the LRU cache.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let inner: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "hashed" => Arc::new(HashedEmbedder::new(config.dimension)),
        "remote" => {
            let api_key = config.remote_api_key.clone().ok_or_else(|| {
                MnemoError::Config("remote embedding provider requires an API key".into())
            })?;
            Arc::new(RemoteEmbedder::new(
                config.remote_base_url.clone(),
                api_key,
                config.remote_model.clone(),
                config.dimension,
            )?)
        }
        #[cfg(feature = "onnx")]
        "onnx" => {
            let model_dir = config.model_dir.clone().ok_or_else(|| {
                MnemoError::Config("onnx embedding provider requires a model directory".into())
            })?;
            Arc::new(OnnxEmbedder::new(&model_dir)?)
        }
        #[cfg(not(feature = "onnx"))]
        "onnx" => {
            return Err(MnemoError::Config(
                "onnx embedding provider requires building with the 'onnx' feature".into(),
            ))
        }
        other => {
            return Err(MnemoError::Config(format!(
                "unknown embedding provider: {other}"
            )))
        }
    };
    Ok(Arc::new(CachedProvider::new(inner, config.cache_size)))
}

/// LRU-caching wrapper around any provider.
///
/// Keys are the SHA-256 of the input text, so the cache is content-addressed
/// the same way memories are.
pub struct CachedProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        Self {
            inner,
            cache: EmbeddingCache::new(capacity),
        }
    }

    pub fn cache_stats(&self) -> EmbeddingCacheStats {
        self.cache.stats()
    }
}

impl EmbeddingProvider for CachedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn ready(&self) -> bool {
        self.inner.ready()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = identity::content_hash(text);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.to_vec());
        }
        let embedding = self.inner.embed(text)?;
        self.cache.put(key, embedding.clone());
        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| identity::content_hash(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = keys
            .iter()
            .map(|k| self.cache.get(k).map(|v| v.to_vec()))
            .collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            let to_embed: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let embedded = self.inner.embed_batch(&to_embed)?;
            for (slot, embedding) in missing.into_iter().zip(embedded) {
                self.cache.put(keys[slot].clone(), embedding.clone());
                out[slot] = Some(embedding);
            }
        }

        Ok(out.into_iter().map(|v| v.expect("all slots filled")).collect())
    }
}

/// Bounded in-flight window for embedding work.
///
/// `max_in_flight` calls run concurrently; up to `max_waiting` callers may
/// queue behind them. Anything beyond that fails with `ResourceExhausted`.
pub struct EmbeddingGate {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    max_waiting: usize,
}

impl EmbeddingGate {
    pub fn new(max_in_flight: usize, max_waiting: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            waiting: AtomicUsize::new(0),
            max_waiting,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        if queued >= self.max_waiting {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(MnemoError::ResourceExhausted(format!(
                "embedding queue full ({} waiting)",
                queued
            )));
        }

        let result = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result.map_err(|_| MnemoError::internal("embedding gate closed"))
    }
}

/// Async handle bundling the provider with its in-flight gate.
///
/// This is what backends hold: every call acquires a gate permit and runs
/// the provider on the blocking pool so the scheduler is never blocked.
#[derive(Clone)]
pub struct EmbeddingHandle {
    provider: Arc<dyn EmbeddingProvider>,
    gate: Arc<EmbeddingGate>,
}

impl EmbeddingHandle {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            gate: Arc::new(EmbeddingGate::new(
                config.max_in_flight,
                config.max_waiting,
            )),
        }
    }

    pub fn model_name(&self) -> String {
        self.provider.model_name().to_string()
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn ready(&self) -> bool {
        self.provider.ready()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _permit = self.gate.acquire().await?;
        let provider = self.provider.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || provider.embed(&text))
            .await
            .map_err(|e| MnemoError::internal(format!("embedding task panicked: {e}")))?
    }

    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let _permit = self.gate.acquire().await?;
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            provider.embed_batch(&refs)
        })
        .await
        .map_err(|e| MnemoError::internal(format!("embedding task panicked: {e}")))?
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Convert an L2 distance between unit vectors into a similarity in [0, 1].
///
/// For L2-normalized vectors, `d^2 = 2 * (1 - cos)`, so `cos = 1 - d^2/2`.
/// Negative cosine clamps to zero.
pub fn distance_to_similarity(distance: f64) -> f32 {
    let cosine = 1.0 - (distance * distance) / 2.0;
    cosine.clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn distance_similarity_bounds() {
        assert!((distance_to_similarity(0.0) - 1.0).abs() < 1e-6);
        // Orthogonal unit vectors: d = sqrt(2) -> cos = 0
        assert!(distance_to_similarity(std::f64::consts::SQRT_2) < 1e-6);
        // Opposite unit vectors: d = 2 -> cos = -1, clamped to 0
        assert_eq!(distance_to_similarity(2.0), 0.0);
    }

    #[test]
    fn cached_provider_hits_on_repeat() {
        let inner = Arc::new(HashedEmbedder::new(64));
        let cached = CachedProvider::new(inner, 16);

        let first = cached.embed("repeat me").unwrap();
        let second = cached.embed("repeat me").unwrap();
        assert_eq!(first, second);

        let stats = cached.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn cached_batch_matches_serial() {
        let inner = Arc::new(HashedEmbedder::new(64));
        let cached = CachedProvider::new(inner.clone(), 16);

        // Prime one entry so the batch mixes hits and misses
        cached.embed("alpha").unwrap();

        let batch = cached.embed_batch(&["alpha", "beta", "gamma"]).unwrap();
        for (text, embedding) in ["alpha", "beta", "gamma"].iter().zip(&batch) {
            assert_eq!(embedding, &inner.embed(text).unwrap());
        }
    }

    #[tokio::test]
    async fn gate_rejects_when_saturated() {
        let gate = EmbeddingGate::new(1, 0);
        let held = gate.acquire().await.unwrap();
        let err = gate.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "resource_exhausted");
        drop(held);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn handle_embeds_through_blocking_pool() {
        let provider = Arc::new(HashedEmbedder::new(32));
        let handle = EmbeddingHandle::new(provider, &crate::config::EmbeddingConfig::default());
        let embedding = handle.embed("hello from the pool").await.unwrap();
        assert_eq!(embedding.len(), 32);
    }
}
