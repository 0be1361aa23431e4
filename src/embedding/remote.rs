//! Remote embedding provider over an OpenAI-compatible API

use serde_json::json;

use crate::embedding::EmbeddingProvider;
use crate::error::{MnemoError, Result};

/// Max inputs per batch request accepted by OpenAI-compatible endpoints
const MAX_BATCH_INPUTS: usize = 2048;

/// Remote embedding client
///
/// Holds a private current-thread runtime so the sync [`EmbeddingProvider`]
/// methods can drive the async HTTP client. Must be called from a blocking
/// thread (which [`crate::embedding::EmbeddingHandle`] guarantees), never
/// from inside the main runtime's async context.
pub struct RemoteEmbedder {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        dimension: usize,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MnemoError::internal(format!("embedding runtime: {e}")))?;

        Ok(Self {
            runtime,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimension,
        })
    }

    async fn request_embeddings(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "input": inputs,
                "model": self.model,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MnemoError::Embedding(format!(
                "embedding API error {status}: {body}"
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let items = data["data"]
            .as_array()
            .ok_or_else(|| MnemoError::Embedding("malformed embedding response".to_string()))?;

        let mut embeddings = Vec::with_capacity(items.len());
        for item in items {
            let vector: Vec<f32> = item["embedding"]
                .as_array()
                .ok_or_else(|| MnemoError::Embedding("missing embedding array".to_string()))?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vector.len() != self.dimension {
                return Err(MnemoError::Embedding(format!(
                    "provider returned {} dims, expected {}",
                    vector.len(),
                    self.dimension
                )));
            }
            embeddings.push(vector);
        }

        Ok(embeddings)
    }
}

impl EmbeddingProvider for RemoteEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.runtime.block_on(self.request_embeddings(&[text]))?;
        result
            .pop()
            .ok_or_else(|| MnemoError::Embedding("empty embedding response".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH_INPUTS) {
            let embeddings = self.runtime.block_on(self.request_embeddings(chunk))?;
            if embeddings.len() != chunk.len() {
                return Err(MnemoError::Embedding(format!(
                    "provider returned {} embeddings for {} inputs",
                    embeddings.len(),
                    chunk.len()
                )));
            }
            all.extend(embeddings);
        }

        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_and_metadata() {
        let embedder = RemoteEmbedder::new(
            "https://api.openai.com/v1/".into(),
            "sk-test".into(),
            "text-embedding-3-small".into(),
            1536,
        )
        .unwrap();

        assert_eq!(embedder.model_name(), "text-embedding-3-small");
        assert_eq!(embedder.dimension(), 1536);
        assert!(embedder.ready());
        assert_eq!(embedder.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn missing_key_reports_not_ready() {
        let embedder = RemoteEmbedder::new(
            "http://localhost:9999".into(),
            String::new(),
            "model".into(),
            8,
        )
        .unwrap();
        assert!(!embedder.ready());
    }
}
