//! On-disk embedded backend behavior: restarts, dimension mismatches,
//! and late embedding
//!
//! Run with: cargo test --test sqlite_backend_tests

mod helpers;

use std::collections::HashMap;

use helpers::{embedding_handle, offline_handle, TEST_DIM};
use mnemo::config::EmbeddedConfig;
use mnemo::storage::{MemoryStorage, SqliteVecStorage};
use mnemo::types::Memory;

fn disk_config(dir: &tempfile::TempDir) -> EmbeddedConfig {
    EmbeddedConfig {
        path: dir
            .path()
            .join("memories.db")
            .to_string_lossy()
            .into_owned(),
        ..EmbeddedConfig::default()
    }
}

fn memory(content: &str, tags: &[&str]) -> Memory {
    Memory::new(
        content,
        tags.iter().map(|t| t.to_string()).collect(),
        None,
        HashMap::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    let hash = {
        let storage = SqliteVecStorage::open(&config, embedding_handle(TEST_DIM)).unwrap();
        storage.initialize().await.unwrap();
        let m = memory("persisted across restarts", &["durable"]);
        let hash = m.content_hash.clone();
        storage.store(m).await.unwrap();
        hash
    };

    let storage = SqliteVecStorage::open(&config, embedding_handle(TEST_DIM)).unwrap();
    storage.initialize().await.unwrap();
    let loaded = storage.get_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(loaded.content, "persisted across restarts");

    let results = storage.retrieve("persisted across restarts", 3).await.unwrap();
    assert_eq!(results[0].memory.content_hash, hash);
}

#[tokio::test]
async fn dimension_mismatch_degrades_but_serves_exact_reads() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    // First life: 16-dim provider
    {
        let storage = SqliteVecStorage::open(&config, embedding_handle(16)).unwrap();
        storage.initialize().await.unwrap();
        storage
            .store(memory("stored at sixteen dims", &["survivor"]))
            .await
            .unwrap();
    }

    // Second life: 32-dim provider against the same file
    let storage = SqliteVecStorage::open(&config, embedding_handle(32)).unwrap();
    let err = storage.initialize().await.unwrap_err();
    assert_eq!(err.kind(), "dimension_mismatch");

    // Writes refuse
    let err = storage
        .store(memory("rejected write", &[]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "dimension_mismatch");

    // Semantic reads refuse
    let err = storage.retrieve("anything", 5).await.unwrap_err();
    assert_eq!(err.kind(), "dimension_mismatch");

    // Tag and hash reads still work
    let found = storage
        .search_by_tag(&["survivor".into()], false)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, "stored at sixteen dims");

    // Health reports the degradation
    let stats = storage.get_stats().await.unwrap();
    assert!(!stats.healthy);
    let mismatch = &stats.details["dimension_mismatch"];
    assert_eq!(mismatch["stored"], 16);
    assert_eq!(mismatch["provider"], 32);
}

#[tokio::test]
async fn late_embedding_after_provider_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    let hash = {
        // Provider offline at write time: record persists without a vector
        let storage = SqliteVecStorage::open(&config, offline_handle(TEST_DIM)).unwrap();
        storage.initialize().await.unwrap();

        let m = memory("notes about the database migration plan", &[]);
        let hash = m.content_hash.clone();
        let outcome = storage.store(m).await.unwrap();
        assert!(outcome.stored);

        // Semantic search degrades to empty rather than failing
        let results = storage.retrieve("database migration", 5).await.unwrap();
        assert!(results.is_empty());
        hash
    };

    // Provider back: the first semantic read backfills the vector
    let storage = SqliteVecStorage::open(&config, embedding_handle(TEST_DIM)).unwrap();
    storage.initialize().await.unwrap();

    let results = storage
        .retrieve("notes about the database migration plan", 5)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory.content_hash, hash);
    assert!(
        results[0].similarity_score > 0.5,
        "near-duplicate query should score high, got {}",
        results[0].similarity_score
    );
}

#[tokio::test]
async fn offline_initialize_records_dimension_for_later() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    {
        let storage = SqliteVecStorage::open(&config, offline_handle(TEST_DIM)).unwrap();
        storage.initialize().await.unwrap();
    }

    // Same dimension on restart: clean initialize
    let storage = SqliteVecStorage::open(&config, embedding_handle(TEST_DIM)).unwrap();
    storage.initialize().await.unwrap();
    assert!(storage.get_stats().await.unwrap().healthy);
}

#[tokio::test]
async fn pragma_overrides_apply() {
    let dir = tempfile::tempdir().unwrap();
    let config = EmbeddedConfig {
        pragma_overrides: Some("cache_size=-32000, temp_store=MEMORY".into()),
        ..disk_config(&dir)
    };

    let storage = SqliteVecStorage::open(&config, embedding_handle(TEST_DIM)).unwrap();
    storage.initialize().await.unwrap();
    storage.store(memory("pragma check", &[])).await.unwrap();

    let stats = storage.get_stats().await.unwrap();
    assert_eq!(stats.details["journal_mode"], "wal");
}

#[tokio::test]
async fn malformed_pragma_override_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = EmbeddedConfig {
        pragma_overrides: Some("not-a-pair".into()),
        ..disk_config(&dir)
    };
    assert!(SqliteVecStorage::open(&config, embedding_handle(TEST_DIM)).is_err());
}
