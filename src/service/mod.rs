//! Unified service layer — the single entry point every transport calls
//!
//! Responsibilities: input validation, hostname tagging, content hashing,
//! per-operation deadlines, response shaping, and delegation to whichever
//! storage backend is configured. Transports stay thin; this layer is the
//! source of truth for behavior.

pub mod responses;

pub use responses::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{MnemoError, Result};
use crate::identity;
use crate::query;
use crate::server::events::{EventBroadcaster, MemoryEvent};
use crate::storage::MemoryStorage;
use crate::types::{
    normalize_metadata, normalize_tag, normalize_tags, ListFilters, Memory, MetadataPatch,
    StorageStats, TimeRange, META_HOSTNAME,
};

/// Per-operation deadlines
#[derive(Debug, Clone)]
pub struct OperationBudgets {
    pub store: Duration,
    pub retrieve: Duration,
    pub search: Duration,
    pub delete: Duration,
    pub stats: Duration,
    pub health: Duration,
}

impl Default for OperationBudgets {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(10),
            retrieve: Duration::from_secs(10),
            search: Duration::from_secs(10),
            delete: Duration::from_secs(5),
            stats: Duration::from_secs(2),
            health: Duration::from_secs(5),
        }
    }
}

/// How long stats responses are served from cache to absorb polling
const STATS_CACHE_TTL: Duration = Duration::from_secs(2);

/// Largest accepted page size for listings
const MAX_PAGE_SIZE: usize = 100;

/// The unified memory service
pub struct MemoryService {
    storage: Arc<dyn MemoryStorage>,
    hostname_tagging: bool,
    process_hostname: String,
    budgets: OperationBudgets,
    stats_cache: Mutex<Option<(Instant, StorageStats)>>,
    events: Option<EventBroadcaster>,
}

impl MemoryService {
    pub fn new(storage: Arc<dyn MemoryStorage>, hostname_tagging: bool) -> Self {
        Self {
            storage,
            hostname_tagging,
            process_hostname: process_hostname(),
            budgets: OperationBudgets::default(),
            stats_cache: Mutex::new(None),
            events: None,
        }
    }

    /// Attach a change-feed broadcaster (coordinator mode).
    pub fn with_events(mut self, events: EventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_budgets(mut self, budgets: OperationBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Initialize the backend. A `DimensionMismatch` here leaves the
    /// service running in degraded mode; the caller decides whether to
    /// continue.
    pub async fn initialize(&self) -> Result<()> {
        self.deadline("initialize", self.budgets.health, self.storage.initialize())
            .await
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.backend_name()
    }

    async fn deadline<T>(
        &self,
        operation: &'static str,
        budget: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(MnemoError::Timeout {
                operation,
                budget_ms: budget.as_millis() as u64,
            }),
        }
    }

    /// Hostname precedence: explicit argument > request header > process.
    fn resolve_hostname(&self, explicit: Option<&str>, header: Option<&str>) -> String {
        explicit
            .or(header)
            .map(str::to_string)
            .unwrap_or_else(|| self.process_hostname.clone())
    }

    fn publish(&self, event: MemoryEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub async fn store_memory(
        &self,
        request: StoreMemoryRequest,
        header_hostname: Option<&str>,
    ) -> Result<StoreMemoryResponse> {
        let mut tags = request.tags;
        let mut metadata = request.metadata;

        if self.hostname_tagging {
            let hostname = self.resolve_hostname(request.client_hostname.as_deref(), header_hostname);
            let source_tag = format!("source:{hostname}");
            if !tags.contains(&source_tag) {
                tags.push(source_tag);
            }
            metadata.insert(META_HOSTNAME.into(), serde_json::json!(hostname));
        }

        let memory = Memory::new(request.content, tags, request.memory_type, metadata)?;
        let content_hash = memory.content_hash.clone();

        let outcome = self
            .deadline("store", self.budgets.store, self.storage.store(memory))
            .await?;

        if outcome.stored {
            self.publish(MemoryEvent::stored(&content_hash));
        }

        Ok(StoreMemoryResponse {
            success: true,
            stored: outcome.stored,
            message: outcome.message,
            content_hash,
        })
    }

    pub async fn retrieve_memory(
        &self,
        request: RetrieveMemoryRequest,
    ) -> Result<RetrieveMemoryResponse> {
        if request.query.trim().is_empty() {
            return Err(MnemoError::InvalidInput("query must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&request.min_similarity) {
            return Err(MnemoError::InvalidInput(
                "min_similarity must be within [0, 1]".into(),
            ));
        }

        let started = Instant::now();
        let results = self
            .deadline(
                "retrieve",
                self.budgets.retrieve,
                self.storage.retrieve(&request.query, request.n_results.max(1)),
            )
            .await?;
        let results = query::apply_min_similarity(results, request.min_similarity);

        Ok(RetrieveMemoryResponse {
            total_found: results.len(),
            results,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    pub async fn search_by_tag(
        &self,
        request: SearchByTagRequest,
    ) -> Result<SearchByTagResponse> {
        if request.tags.is_empty() {
            return Err(MnemoError::InvalidInput(
                "at least one tag is required".into(),
            ));
        }
        let tags = normalize_tags(request.tags)?;

        let results = self
            .deadline(
                "search_by_tag",
                self.budgets.search,
                self.storage.search_by_tag(&tags, request.match_all),
            )
            .await?;

        Ok(SearchByTagResponse {
            total_found: results.len(),
            results,
            search_tags: tags,
            match_all: request.match_all,
        })
    }

    pub async fn search_by_time(
        &self,
        request: SearchByTimeRequest,
    ) -> Result<SearchByTimeResponse> {
        let range = self.resolve_time_range(&request)?;

        let results = self
            .deadline(
                "search_by_time",
                self.budgets.search,
                self.storage.search_by_time(range, request.n_results.max(1)),
            )
            .await?;

        Ok(SearchByTimeResponse {
            total_found: results.len(),
            results,
            start: identity::timestamp_to_iso(range.start),
            end: identity::timestamp_to_iso(range.end),
        })
    }

    fn resolve_time_range(&self, request: &SearchByTimeRequest) -> Result<TimeRange> {
        if let Some(query) = &request.query {
            return query::parse_time_query(query);
        }
        if request.start.is_none() && request.end.is_none() {
            return Err(MnemoError::InvalidInput(
                "time search requires a query or start/end bounds".into(),
            ));
        }
        let start = match &request.start {
            Some(value) => identity::parse_timestamp(value)?,
            None => 0.0,
        };
        let end = match &request.end {
            Some(value) => identity::parse_timestamp(value)?,
            None => identity::now(),
        };
        if start > end {
            return Err(MnemoError::InvalidInput(
                "time range start is after end".into(),
            ));
        }
        Ok(TimeRange::new(start, end))
    }

    pub async fn search_similar(
        &self,
        request: SearchSimilarRequest,
    ) -> Result<SearchSimilarResponse> {
        let results = self
            .deadline(
                "search_similar",
                self.budgets.retrieve,
                self.storage
                    .search_similar_to(&request.content_hash, request.n_results.max(1)),
            )
            .await?;

        Ok(SearchSimilarResponse {
            total_found: results.len(),
            results,
            source_hash: request.content_hash,
        })
    }

    pub async fn get_memory(&self, content_hash: &str) -> Result<Memory> {
        let memory = self
            .deadline(
                "get_memory",
                self.budgets.search,
                self.storage.get_by_hash(content_hash),
            )
            .await?;
        memory.ok_or_else(|| MnemoError::NotFound(content_hash.to_string()))
    }

    pub async fn delete_memory(&self, content_hash: &str) -> Result<DeleteMemoryResponse> {
        let outcome = self
            .deadline(
                "delete",
                self.budgets.delete,
                self.storage.delete(content_hash),
            )
            .await?;

        if outcome.deleted {
            self.publish(MemoryEvent::deleted(content_hash));
        }

        Ok(DeleteMemoryResponse {
            success: outcome.deleted,
            message: outcome.message,
            content_hash: content_hash.to_string(),
        })
    }

    pub async fn delete_by_tag(
        &self,
        request: DeleteByTagRequest,
    ) -> Result<DeleteByTagResponse> {
        let tag = normalize_tag(&request.tag)?;
        let count = self
            .deadline(
                "delete_by_tag",
                self.budgets.delete,
                self.storage.delete_by_tag(&tag),
            )
            .await?;
        Ok(DeleteByTagResponse { tag, count })
    }

    pub async fn delete_by_time_range(
        &self,
        request: DeleteByTimeRangeRequest,
    ) -> Result<DeleteByTimeRangeResponse> {
        let range = query::parse_time_query(&request.query)?;
        let count = self
            .deadline(
                "delete_by_time_range",
                self.budgets.delete,
                self.storage.delete_by_time_range(range),
            )
            .await?;
        Ok(DeleteByTimeRangeResponse { count })
    }

    pub async fn update_memory_metadata(
        &self,
        request: UpdateMemoryMetadataRequest,
    ) -> Result<UpdateMemoryMetadataResponse> {
        let patch = MetadataPatch {
            metadata: request.metadata.map(normalize_metadata).transpose()?,
            tags: request.tags.map(normalize_tags).transpose()?,
            memory_type: request.memory_type,
        };

        let updated = self
            .deadline(
                "update_metadata",
                self.budgets.store,
                self.storage
                    .update_memory_metadata(&request.content_hash, patch),
            )
            .await?;

        Ok(UpdateMemoryMetadataResponse {
            success: true,
            content_hash: updated.content_hash,
        })
    }

    pub async fn list_memories(
        &self,
        request: ListMemoriesRequest,
    ) -> Result<ListMemoriesResponse> {
        if request.page == 0 {
            return Err(MnemoError::InvalidInput("page numbers start at 1".into()));
        }
        let page_size = request.page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (request.page - 1) * page_size;

        let filters = ListFilters {
            tag: request.tag.as_deref().map(normalize_tag).transpose()?,
            memory_type: request.memory_type,
        };

        let page = self
            .deadline(
                "list",
                self.budgets.search,
                self.storage.list(offset, page_size, &filters),
            )
            .await?;

        let has_more = (offset + page.memories.len()) < page.total as usize;
        Ok(ListMemoriesResponse {
            results: page.memories,
            total: page.total,
            page: request.page,
            page_size,
            has_more,
        })
    }

    pub async fn list_tags(&self) -> Result<ListTagsResponse> {
        let tags = self
            .deadline("list_tags", self.budgets.search, self.storage.list_tags())
            .await?;
        Ok(ListTagsResponse {
            tags: tags
                .into_iter()
                .map(|(tag, count)| TagCount { tag, count })
                .collect(),
        })
    }

    /// Merge duplicate rows (maintenance entry point).
    pub async fn cleanup_duplicates(&self) -> Result<usize> {
        self.deadline(
            "cleanup_duplicates",
            self.budgets.store,
            self.storage.cleanup_duplicates(),
        )
        .await
    }

    /// Stats, served from a short-TTL cache to absorb dashboard polling.
    pub async fn get_stats(&self) -> Result<StorageStats> {
        {
            let cache = self.stats_cache.lock();
            if let Some((at, stats)) = &*cache {
                if at.elapsed() < STATS_CACHE_TTL {
                    return Ok(stats.clone());
                }
            }
        }

        let stats = self
            .deadline("get_stats", self.budgets.stats, self.storage.get_stats())
            .await?;
        *self.stats_cache.lock() = Some((Instant::now(), stats.clone()));
        Ok(stats)
    }

    /// Full health check: the §4.11 stats shape, bypassing nothing —
    /// a degraded backend reports `healthy = false` with details.
    pub async fn check_database_health(&self) -> Result<StorageStats> {
        self.deadline("health", self.budgets.health, self.storage.get_stats())
            .await
    }
}

fn process_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
