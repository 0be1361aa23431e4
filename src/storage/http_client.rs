//! HTTP-federated storage backend
//!
//! Satisfies the storage interface by calling a coordinator's HTTP API
//! instead of opening the database directly. Used by replica processes
//! that must not own the embedded file. Wire shapes are exactly the
//! coordinator's (see `server::http`); transport failures surface as
//! `BackendUnavailable` and coordinator errors keep their taxonomy kind.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::FederatedConfig;
use crate::error::{MnemoError, Result};
use crate::identity;
use crate::service::responses::{
    DeleteByTagResponse, DeleteByTimeRangeResponse, DeleteMemoryResponse, ErrorBody,
    ListMemoriesResponse, ListTagsResponse, RetrieveMemoryResponse, SearchByTagResponse,
    SearchByTimeResponse, SearchSimilarResponse, StoreMemoryResponse,
};
use crate::storage::MemoryStorage;
use crate::types::{
    DeleteOutcome, ListFilters, ListPage, Memory, MemoryQueryResult, MetadataPatch, StorageStats,
    StoreOutcome, TimeRange,
};

/// Federated storage client
pub struct FederatedStorage {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for FederatedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedStorage")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl FederatedStorage {
    pub fn new(config: FederatedConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(MnemoError::Config(
                "federated backend requires a coordinator endpoint".into(),
            ));
        }
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| MnemoError::BackendUnavailable(format!("coordinator unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        // Coordinator errors carry their taxonomy kind in the body
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(MnemoError::from_kind(&body.error.kind, body.error.message)),
            Err(_) => Err(match status.as_u16() {
                401 => MnemoError::Unauthorized("coordinator rejected credentials".into()),
                404 => MnemoError::NotFound("resource not found".into()),
                _ => MnemoError::BackendUnavailable(format!("coordinator returned {status}")),
            }),
        }
    }
}

#[async_trait]
impl MemoryStorage for FederatedStorage {
    async fn initialize(&self) -> Result<()> {
        let _: serde_json::Value = self.send(self.http.get(self.url("/api/health"))).await?;
        Ok(())
    }

    async fn store(&self, memory: Memory) -> Result<StoreOutcome> {
        // The coordinator is the writer; it recomputes the hash from the
        // same content and stamps authoritative timestamps.
        let body = json!({
            "content": memory.content,
            "tags": memory.tags,
            "memory_type": memory.memory_type,
            "metadata": memory.metadata,
        });
        let response: StoreMemoryResponse = self
            .send(self.http.post(self.url("/api/memories")).json(&body))
            .await?;
        Ok(StoreOutcome {
            stored: response.stored,
            message: response.message,
        })
    }

    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        let body = json!({ "query": query, "n_results": n_results });
        let response: RetrieveMemoryResponse = self
            .send(self.http.post(self.url("/api/search")).json(&body))
            .await?;
        Ok(response.results)
    }

    async fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>> {
        let body = json!({ "tags": tags, "match_all": match_all });
        let response: SearchByTagResponse = self
            .send(self.http.post(self.url("/api/search/by-tag")).json(&body))
            .await?;
        Ok(response.results)
    }

    async fn search_by_time(&self, range: TimeRange, n_results: usize) -> Result<Vec<Memory>> {
        let body = json!({
            "start": range.start.to_string(),
            "end": range.end.to_string(),
            "n_results": n_results,
        });
        let response: SearchByTimeResponse = self
            .send(self.http.post(self.url("/api/search/by-time")).json(&body))
            .await?;
        Ok(response.results)
    }

    async fn search_similar_to(
        &self,
        content_hash: &str,
        n_results: usize,
    ) -> Result<Vec<MemoryQueryResult>> {
        let body = json!({ "content_hash": content_hash, "n_results": n_results });
        let response: SearchSimilarResponse = self
            .send(self.http.post(self.url("/api/search/similar")).json(&body))
            .await?;
        Ok(response.results)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let result: Result<Memory> = self
            .send(
                self.http
                    .get(self.url(&format!("/api/memories/{content_hash}"))),
            )
            .await;
        match result {
            Ok(memory) => Ok(Some(memory)),
            Err(MnemoError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, content_hash: &str) -> Result<DeleteOutcome> {
        let response: DeleteMemoryResponse = self
            .send(
                self.http
                    .delete(self.url(&format!("/api/memories/{content_hash}"))),
            )
            .await?;
        Ok(DeleteOutcome {
            deleted: response.success,
            message: response.message,
        })
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let body = json!({ "tag": tag });
        let response: DeleteByTagResponse = self
            .send(
                self.http
                    .post(self.url("/api/memories/delete-by-tag"))
                    .json(&body),
            )
            .await?;
        Ok(response.count)
    }

    async fn delete_by_time_range(&self, range: TimeRange) -> Result<usize> {
        // RFC 3339 instants keep the bounds exact through the grammar
        let body = json!({
            "query": format!(
                "between {} and {}",
                identity::timestamp_to_iso(range.start),
                identity::timestamp_to_iso(range.end),
            ),
        });
        let response: DeleteByTimeRangeResponse = self
            .send(
                self.http
                    .post(self.url("/api/memories/delete-by-time"))
                    .json(&body),
            )
            .await?;
        Ok(response.count)
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: MetadataPatch,
    ) -> Result<Memory> {
        let body = json!({
            "content_hash": content_hash,
            "metadata": patch.metadata,
            "tags": patch.tags,
            "memory_type": patch.memory_type,
        });
        let _: serde_json::Value = self
            .send(
                self.http
                    .patch(self.url(&format!("/api/memories/{content_hash}")))
                    .json(&body),
            )
            .await?;

        self.get_by_hash(content_hash)
            .await?
            .ok_or_else(|| MnemoError::NotFound(content_hash.to_string()))
    }

    async fn cleanup_duplicates(&self) -> Result<usize> {
        let response: HashMap<String, usize> = self
            .send(
                self.http
                    .post(self.url("/api/maintenance/cleanup-duplicates")),
            )
            .await?;
        Ok(response.get("count").copied().unwrap_or(0))
    }

    async fn list(&self, offset: usize, limit: usize, filters: &ListFilters) -> Result<ListPage> {
        let page = offset / limit.max(1) + 1;
        let mut query: Vec<(String, String)> = vec![
            ("page".into(), page.to_string()),
            ("page_size".into(), limit.to_string()),
        ];
        if let Some(tag) = &filters.tag {
            query.push(("tag".into(), tag.clone()));
        }
        if let Some(memory_type) = &filters.memory_type {
            query.push(("type".into(), memory_type.clone()));
        }

        let response: ListMemoriesResponse = self
            .send(self.http.get(self.url("/api/memories")).query(&query))
            .await?;
        Ok(ListPage {
            memories: response.results,
            total: response.total,
        })
    }

    async fn list_tags(&self) -> Result<Vec<(String, i64)>> {
        let response: ListTagsResponse = self.send(self.http.get(self.url("/api/tags"))).await?;
        Ok(response
            .tags
            .into_iter()
            .map(|entry| (entry.tag, entry.count))
            .collect())
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let mut stats: StorageStats = self
            .send(self.http.get(self.url("/api/health/detailed")))
            .await?;
        stats.backend = "federated".into();
        stats
            .details
            .insert("coordinator".into(), json!(self.endpoint));
        Ok(stats)
    }

    fn backend_name(&self) -> &'static str {
        "federated"
    }
}
