#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use mnemo::config::EmbeddingConfig;
use mnemo::embedding::{EmbeddingHandle, EmbeddingProvider, HashedEmbedder};
use mnemo::error::{MnemoError, Result};
use mnemo::service::{MemoryService, StoreMemoryRequest};
use mnemo::storage::SqliteVecStorage;

/// Deterministic in-process embedder used across the suite.
pub const TEST_DIM: usize = 64;

pub fn embedding_handle(dimension: usize) -> EmbeddingHandle {
    EmbeddingHandle::new(
        Arc::new(HashedEmbedder::new(dimension)),
        &EmbeddingConfig::default(),
    )
}

/// Provider that is never ready, for exercising the late-embedding path.
pub struct OfflineProvider {
    dimension: usize,
}

impl OfflineProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingProvider for OfflineProvider {
    fn model_name(&self) -> &str {
        "offline"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn ready(&self) -> bool {
        false
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(MnemoError::Embedding("provider offline".into()))
    }
}

pub fn offline_handle(dimension: usize) -> EmbeddingHandle {
    EmbeddingHandle::new(
        Arc::new(OfflineProvider::new(dimension)),
        &EmbeddingConfig::default(),
    )
}

/// Fresh in-memory service with the deterministic embedder.
pub async fn test_service() -> MemoryService {
    let storage = Arc::new(SqliteVecStorage::open_in_memory(embedding_handle(TEST_DIM)).unwrap());
    let service = MemoryService::new(storage, false);
    service.initialize().await.unwrap();
    service
}

pub fn store_request(content: &str, tags: &[&str]) -> StoreMemoryRequest {
    StoreMemoryRequest {
        content: content.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        memory_type: None,
        metadata: HashMap::new(),
        client_hostname: None,
    }
}
