//! Storage backends for the memory engine
//!
//! The [`MemoryStorage`] trait defines the capability surface every
//! backend satisfies. Three implementations exist:
//!
//! - [`SqliteVecStorage`] — embedded single-file SQLite with a sqlite-vec
//!   vector index (default)
//! - [`CloudStorage`] — external vector index + relational store +
//!   optional object store, spoken to over HTTP
//! - [`FederatedStorage`] — thin client that calls a coordinator's HTTP
//!   API instead of opening the database itself
//!
//! All methods are async; backends built on synchronous primitives run
//! them on the blocking pool so the scheduler is never held.

pub mod cloud;
pub mod http_client;
pub mod sqlite_vec;

pub use cloud::CloudStorage;
pub use http_client::FederatedStorage;
pub use sqlite_vec::SqliteVecStorage;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    DeleteOutcome, ListFilters, ListPage, Memory, MemoryQueryResult, MetadataPatch, StorageStats,
    StoreOutcome, TimeRange,
};

/// The storage capability surface
///
/// Contracts (all backends):
/// - `store` never fails on duplicates; it reports `stored = false`
/// - `retrieve` and `search_similar_to` order results by similarity
///   descending, `created_at` descending, `content_hash` ascending
/// - `search_by_tag` with `match_all` requires a tag superset; without it,
///   any intersection matches
/// - time bounds are inclusive
/// - `delete` removes the record, its tag rows, and its vector atomically
///   from the caller's perspective
/// - `update_memory_metadata` merges metadata, replaces tags when given,
///   and bumps `updated_at`
/// - `list` filters before paginating, ordered `created_at` descending
///   with `content_hash` ascending tie-break
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    /// Create schema, verify the embedding dimension against any stored
    /// dimension, and run pending repairs. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Persist a memory. Returns `stored = false` for duplicates.
    async fn store(&self, memory: Memory) -> Result<StoreOutcome>;

    /// Semantic nearest-neighbor retrieval for a text query.
    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>>;

    /// Tag search. `match_all = true` is set-superset (AND), otherwise
    /// intersection (OR). Results ordered by `created_at` descending.
    async fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>>;

    /// Memories created within the inclusive range, newest first.
    async fn search_by_time(&self, range: TimeRange, n_results: usize) -> Result<Vec<Memory>>;

    /// Nearest neighbors of an existing memory, excluding it.
    async fn search_similar_to(
        &self,
        content_hash: &str,
        n_results: usize,
    ) -> Result<Vec<MemoryQueryResult>>;

    /// Exact lookup by content hash.
    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>>;

    /// Delete one memory and everything attached to it.
    async fn delete(&self, content_hash: &str) -> Result<DeleteOutcome>;

    /// Delete every memory carrying the tag. Returns the count.
    async fn delete_by_tag(&self, tag: &str) -> Result<usize>;

    /// Delete every memory created within the inclusive range.
    async fn delete_by_time_range(&self, range: TimeRange) -> Result<usize>;

    /// Apply a metadata patch. Fails with `NotFound` for unknown hashes.
    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: MetadataPatch,
    ) -> Result<Memory>;

    /// Merge records sharing a content hash, keeping the earliest
    /// `created_at` and the union of tags. Returns removed row count.
    async fn cleanup_duplicates(&self) -> Result<usize>;

    /// Filtered, paginated listing.
    async fn list(&self, offset: usize, limit: usize, filters: &ListFilters) -> Result<ListPage>;

    /// All tags with usage counts, most used first.
    async fn list_tags(&self) -> Result<Vec<(String, i64)>>;

    /// Uniform statistics; cheap enough to poll.
    async fn get_stats(&self) -> Result<StorageStats>;

    /// Backend identifier: "embedded", "cloud", or "federated".
    fn backend_name(&self) -> &'static str;
}
