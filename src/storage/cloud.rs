//! Cloud storage backend: external vector index + relational store +
//! optional object store
//!
//! All three services are spoken to over HTTP with bearer auth. Writes
//! follow the order object upload -> relational insert -> vector upsert;
//! a failed vector upsert leaves the record readable by tag/time/hash and
//! queues the hash in a `vector_repair` table that `initialize` drains.
//! Transient failures retry with exponential backoff and jitter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::CloudConfig;
use crate::embedding::EmbeddingHandle;
use crate::error::{MnemoError, Result};
use crate::identity;
use crate::query::{self, MIN_CANDIDATE_POOL};
use crate::storage::MemoryStorage;
use crate::types::{
    human_bytes, DeleteOutcome, ListFilters, ListPage, Memory, MemoryQueryResult, MetadataPatch,
    StorageStats, StoreOutcome, TimeRange, META_LARGE_CONTENT_REF, META_ORIGINAL_LENGTH,
};

/// Generic API response envelope
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct VectorMatches {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}

#[derive(Debug, Deserialize)]
struct VectorMatch {
    id: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct VectorRecord {
    id: String,
    #[serde(default)]
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct IndexInfo {
    config: IndexConfig,
}

#[derive(Debug, Deserialize)]
struct IndexConfig {
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct SqlResult {
    #[serde(default)]
    results: Vec<Map<String, Value>>,
}

/// Cloud vector+relational storage backend
pub struct CloudStorage {
    http: reqwest::Client,
    config: CloudConfig,
    embedder: EmbeddingHandle,
    conflict: Arc<Mutex<Option<(usize, usize)>>>,
}

impl std::fmt::Debug for CloudStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CloudStorage {
    pub fn new(config: CloudConfig, embedder: EmbeddingHandle) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            config,
            embedder,
            conflict: Arc::new(Mutex::new(None)),
        })
    }

    fn ensure_dimension_ok(&self) -> Result<()> {
        if let Some((stored, provider)) = *self.conflict.lock() {
            return Err(MnemoError::DimensionMismatch { stored, provider });
        }
        Ok(())
    }

    fn vector_url(&self, suffix: &str) -> String {
        format!(
            "{}/accounts/{}/vectorize/v2/indexes/{}{}",
            self.config.api_base, self.config.account, self.config.vector_index, suffix
        )
    }

    fn sql_url(&self) -> String {
        format!(
            "{}/accounts/{}/d1/database/{}/query",
            self.config.api_base, self.config.account, self.config.relational_db
        )
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/accounts/{}/r2/buckets/{}/objects/{}",
            self.config.api_base, self.config.account, bucket, key
        )
    }

    /// Retry a transient-failure-prone call with exponential backoff.
    async fn with_retries<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = self.config.base_delay_s * f64::powi(2.0, attempt as i32);
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.25);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %e,
                        "transient cloud failure; backing off"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(backoff + jitter)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(MnemoError::BackendUnavailable(format!(
                "cloud API returned {status}"
            )));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(MnemoError::Unauthorized("cloud API rejected token".into()));
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        if !envelope.success {
            let message = envelope
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown cloud API error".into());
            return Err(MnemoError::BackendUnavailable(message));
        }
        envelope
            .result
            .ok_or_else(|| MnemoError::internal("cloud API returned empty result"))
    }

    /// Run one parameterized SQL statement against the relational store.
    async fn sql(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Map<String, Value>>> {
        let body = json!({ "sql": sql, "params": params });
        let results: Vec<SqlResult> = self
            .with_retries("relational query", || {
                let body = &body;
                async move {
                    let response = self
                        .http
                        .post(self.sql_url())
                        .bearer_auth(&self.config.token)
                        .json(body)
                        .send()
                        .await?;
                    Self::parse_envelope(response).await
                }
            })
            .await?;
        Ok(results.into_iter().next().map(|r| r.results).unwrap_or_default())
    }

    /// Upsert vectors as newline-delimited JSON records.
    async fn upsert_vectors(&self, records: &[(String, Vec<f32>, Value)]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for (id, values, metadata) in records {
            body.push_str(
                &json!({ "id": id, "values": values, "metadata": metadata }).to_string(),
            );
            body.push('\n');
        }

        let _: Value = self
            .with_retries("vector upsert", || {
                let body = body.clone();
                async move {
                    let response = self
                        .http
                        .post(self.vector_url("/upsert"))
                        .bearer_auth(&self.config.token)
                        .header("Content-Type", "application/x-ndjson")
                        .body(body)
                        .send()
                        .await?;
                    Self::parse_envelope(response).await
                }
            })
            .await?;
        Ok(())
    }

    async fn query_vectors(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>> {
        let body = json!({
            "vector": vector,
            "topK": top_k,
            "returnValues": false,
            "returnMetadata": "none",
        });
        let matches: VectorMatches = self
            .with_retries("vector query", || {
                let body = &body;
                async move {
                    let response = self
                        .http
                        .post(self.vector_url("/query"))
                        .bearer_auth(&self.config.token)
                        .json(body)
                        .send()
                        .await?;
                    Self::parse_envelope(response).await
                }
            })
            .await?;
        Ok(matches.matches)
    }

    async fn get_vector(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let body = json!({ "ids": [id] });
        let records: Vec<VectorRecord> = self
            .with_retries("vector fetch", || {
                let body = &body;
                async move {
                    let response = self
                        .http
                        .post(self.vector_url("/get_by_ids"))
                        .bearer_auth(&self.config.token)
                        .json(body)
                        .send()
                        .await?;
                    Self::parse_envelope(response).await
                }
            })
            .await?;
        Ok(records
            .into_iter()
            .find(|r| r.id == id)
            .map(|r| r.values)
            .filter(|v| !v.is_empty()))
    }

    async fn delete_vectors(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "ids": ids });
        let _: Value = self
            .with_retries("vector delete", || {
                let body = &body;
                async move {
                    let response = self
                        .http
                        .post(self.vector_url("/delete_by_ids"))
                        .bearer_auth(&self.config.token)
                        .json(body)
                        .send()
                        .await?;
                    Self::parse_envelope(response).await
                }
            })
            .await?;
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, key: &str, body: String) -> Result<()> {
        self.with_retries("object upload", || {
            let body = body.clone();
            async move {
                let response = self
                    .http
                    .put(self.object_url(bucket, key))
                    .bearer_auth(&self.config.token)
                    .body(body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(MnemoError::BackendUnavailable(format!(
                        "object upload failed: {}",
                        response.status()
                    )));
                }
                Ok(())
            }
        })
        .await
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<String> {
        self.with_retries("object fetch", || async move {
            let response = self
                .http
                .get(self.object_url(bucket, key))
                .bearer_auth(&self.config.token)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(MnemoError::BackendUnavailable(format!(
                    "object fetch failed: {}",
                    response.status()
                )));
            }
            Ok(response.text().await?)
        })
        .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.with_retries("object delete", || async move {
            let response = self
                .http
                .delete(self.object_url(bucket, key))
                .bearer_auth(&self.config.token)
                .send()
                .await?;
            // Missing objects are already gone
            if !response.status().is_success() && response.status().as_u16() != 404 {
                return Err(MnemoError::BackendUnavailable(format!(
                    "object delete failed: {}",
                    response.status()
                )));
            }
            Ok(())
        })
        .await
    }

    /// Restore spilled content when a row carries a large-object pointer.
    async fn hydrate_content(&self, memory: &mut Memory) -> Result<()> {
        let Some(bucket) = &self.config.object_bucket else {
            return Ok(());
        };
        let Some(Value::String(key)) = memory.metadata.get(META_LARGE_CONTENT_REF).cloned()
        else {
            return Ok(());
        };
        memory.content = self.fetch_object(bucket, &key).await?;
        Ok(())
    }

    async fn load_memories_by_hashes(&self, hashes: &[String]) -> Result<Vec<Memory>> {
        if hashes.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let rows = self
            .sql(
                &format!(
                    "SELECT content_hash, content, memory_type, created_at, updated_at, \
                     tags_json, metadata_json FROM memories \
                     WHERE content_hash IN ({placeholders})"
                ),
                hashes.iter().map(|h| json!(h)).collect(),
            )
            .await?;
        rows.into_iter().map(row_to_memory).collect()
    }

    /// Re-upsert vectors for rows whose indexing was deferred.
    async fn run_repair_pass(&self) -> Result<()> {
        if !self.embedder.ready() {
            return Ok(());
        }

        let rows = self
            .sql(
                "SELECT m.content_hash, m.content FROM vector_repair r \
                 JOIN memories m ON m.content_hash = r.content_hash LIMIT 100",
                vec![],
            )
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut hashes = Vec::with_capacity(rows.len());
        let mut contents = Vec::with_capacity(rows.len());
        for row in &rows {
            let (Some(hash), Some(content)) = (
                row.get("content_hash").and_then(Value::as_str),
                row.get("content").and_then(Value::as_str),
            ) else {
                continue;
            };
            hashes.push(hash.to_string());
            contents.push(content.to_string());
        }

        let embeddings = match self.embedder.embed_batch(contents).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(error = %e, "repair pass embedding failed");
                return Ok(());
            }
        };

        let records: Vec<(String, Vec<f32>, Value)> = hashes
            .iter()
            .cloned()
            .zip(embeddings)
            .map(|(hash, vector)| (hash, vector, json!({})))
            .collect();

        if let Err(e) = self.upsert_vectors(&records).await {
            tracing::warn!(error = %e, "repair pass upsert failed; queue kept");
            return Ok(());
        }

        let placeholders = vec!["?"; hashes.len()].join(", ");
        self.sql(
            &format!("DELETE FROM vector_repair WHERE content_hash IN ({placeholders})"),
            hashes.iter().map(|h| json!(h)).collect(),
        )
        .await?;
        tracing::info!(count = hashes.len(), "repaired deferred vector upserts");
        Ok(())
    }
}

#[async_trait]
impl MemoryStorage for CloudStorage {
    async fn initialize(&self) -> Result<()> {
        // Relational schema first so repair bookkeeping always has a home
        for ddl in [
            "CREATE TABLE IF NOT EXISTS memories (
                content_hash TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                memory_type TEXT NOT NULL DEFAULT 'note',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]',
                metadata_json TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at)",
            "CREATE TABLE IF NOT EXISTS memory_tags (
                content_hash TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (content_hash, tag)
            )",
            "CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag)",
            "CREATE TABLE IF NOT EXISTS vector_repair (content_hash TEXT PRIMARY KEY)",
        ] {
            self.sql(ddl, vec![]).await?;
        }

        // Verify the remote index width against the provider
        let info: IndexInfo = self
            .with_retries("index info", || async move {
                let response = self
                    .http
                    .get(self.vector_url(""))
                    .bearer_auth(&self.config.token)
                    .send()
                    .await?;
                Self::parse_envelope(response).await
            })
            .await?;

        let provider_dim = self.embedder.dimension();
        if info.config.dimensions != provider_dim {
            *self.conflict.lock() = Some((info.config.dimensions, provider_dim));
            return Err(MnemoError::DimensionMismatch {
                stored: info.config.dimensions,
                provider: provider_dim,
            });
        }

        self.run_repair_pass().await
    }

    async fn store(&self, mut memory: Memory) -> Result<StoreOutcome> {
        self.ensure_dimension_ok()?;

        let existing = self
            .sql(
                "SELECT 1 AS present FROM memories WHERE content_hash = ?",
                vec![json!(memory.content_hash)],
            )
            .await?;
        if !existing.is_empty() {
            return Ok(StoreOutcome {
                stored: false,
                message: "duplicate".into(),
            });
        }

        // Step (a): offload oversized content before anything references it
        let content_for_embedding = memory.content.clone();
        if memory.content.len() > self.config.large_content_threshold {
            let Some(bucket) = self.config.object_bucket.clone() else {
                return Err(MnemoError::InvalidInput(format!(
                    "content exceeds {} bytes and no object bucket is configured",
                    self.config.large_content_threshold
                )));
            };
            let key = memory.content_hash.clone();
            self.upload_object(&bucket, &key, memory.content.clone())
                .await?;
            memory
                .metadata
                .insert(META_ORIGINAL_LENGTH.into(), json!(memory.content.len()));
            memory
                .metadata
                .insert(META_LARGE_CONTENT_REF.into(), json!(key));
            memory.content = String::new();
        }

        // Step (b): relational row + tags
        self.sql(
            "INSERT INTO memories (content_hash, content, memory_type, created_at, \
             updated_at, tags_json, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(content_hash) DO NOTHING",
            vec![
                json!(memory.content_hash),
                json!(memory.content),
                json!(memory.memory_type),
                json!(memory.created_at),
                json!(memory.updated_at),
                json!(serde_json::to_string(&memory.tags)?),
                json!(serde_json::to_string(&memory.metadata)?),
            ],
        )
        .await?;
        for tag in &memory.tags {
            self.sql(
                "INSERT INTO memory_tags (content_hash, tag) VALUES (?, ?) \
                 ON CONFLICT(content_hash, tag) DO NOTHING",
                vec![json!(memory.content_hash), json!(tag)],
            )
            .await?;
        }

        // Step (c): vector upsert; failure defers to the repair queue
        let vector = if self.embedder.ready() {
            match self.embedder.embed(&content_for_embedding).await {
                Ok(vector) => Some(vector),
                Err(e @ MnemoError::ResourceExhausted(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed; deferring vector upsert");
                    None
                }
            }
        } else {
            None
        };

        let indexed = match vector {
            Some(vector) => {
                let record = (
                    memory.content_hash.clone(),
                    vector,
                    json!({ "memory_type": memory.memory_type, "created_at": memory.created_at }),
                );
                match self.upsert_vectors(&[record]).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, hash = %memory.content_hash,
                            "vector upsert failed; queued for repair");
                        false
                    }
                }
            }
            None => false,
        };

        if !indexed {
            self.sql(
                "INSERT INTO vector_repair (content_hash) VALUES (?) \
                 ON CONFLICT(content_hash) DO NOTHING",
                vec![json!(memory.content_hash)],
            )
            .await?;
        }

        Ok(StoreOutcome {
            stored: true,
            message: if indexed {
                "memory stored".into()
            } else {
                "memory stored; vector indexing deferred".into()
            },
        })
    }

    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        self.ensure_dimension_ok()?;

        if !self.embedder.ready() {
            tracing::warn!("embedding provider unavailable; semantic search degraded");
            return Ok(vec![]);
        }
        let vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; returning empty result");
                return Ok(vec![]);
            }
        };

        let matches = self
            .query_vectors(&vector, n_results.max(MIN_CANDIDATE_POOL))
            .await?;
        let scores: HashMap<String, f64> =
            matches.iter().map(|m| (m.id.clone(), m.score)).collect();
        let ids: Vec<String> = matches.into_iter().map(|m| m.id).collect();

        let memories = self.load_memories_by_hashes(&ids).await?;
        let mut results = Vec::with_capacity(memories.len());
        for mut memory in memories {
            self.hydrate_content(&mut memory).await?;
            let score = scores
                .get(&memory.content_hash)
                .copied()
                .unwrap_or(0.0)
                .clamp(0.0, 1.0) as f32;
            results.push(MemoryQueryResult {
                memory,
                similarity_score: score,
                relevance_reason: format!("vector:{score:.4}"),
            });
        }

        query::rank_results(&mut results);
        results.truncate(n_results);
        Ok(results)
    }

    async fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>> {
        if tags.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; tags.len()].join(", ");
        let mut params: Vec<Value> = tags.iter().map(|t| json!(t)).collect();
        let sql = if match_all {
            params.push(json!(tags.len() as i64));
            format!(
                "SELECT m.content_hash, m.content, m.memory_type, m.created_at, m.updated_at, \
                 m.tags_json, m.metadata_json FROM memories m JOIN memory_tags t \
                 ON t.content_hash = m.content_hash WHERE t.tag IN ({placeholders}) \
                 GROUP BY m.content_hash HAVING COUNT(DISTINCT t.tag) = ? \
                 ORDER BY m.created_at DESC, m.content_hash ASC"
            )
        } else {
            format!(
                "SELECT DISTINCT m.content_hash, m.content, m.memory_type, m.created_at, \
                 m.updated_at, m.tags_json, m.metadata_json FROM memories m JOIN memory_tags t \
                 ON t.content_hash = m.content_hash WHERE t.tag IN ({placeholders}) \
                 ORDER BY m.created_at DESC, m.content_hash ASC"
            )
        };

        let rows = self.sql(&sql, params).await?;
        rows.into_iter().map(row_to_memory).collect()
    }

    async fn search_by_time(&self, range: TimeRange, n_results: usize) -> Result<Vec<Memory>> {
        let rows = self
            .sql(
                "SELECT content_hash, content, memory_type, created_at, updated_at, \
                 tags_json, metadata_json FROM memories \
                 WHERE created_at >= ? AND created_at <= ? \
                 ORDER BY created_at DESC, content_hash ASC LIMIT ?",
                vec![json!(range.start), json!(range.end), json!(n_results as i64)],
            )
            .await?;
        rows.into_iter().map(row_to_memory).collect()
    }

    async fn search_similar_to(
        &self,
        content_hash: &str,
        n_results: usize,
    ) -> Result<Vec<MemoryQueryResult>> {
        self.ensure_dimension_ok()?;

        let source = self.get_by_hash(content_hash).await?;
        let Some(source) = source else {
            return Err(MnemoError::NotFound(content_hash.to_string()));
        };

        let vector = match self.get_vector(content_hash).await? {
            Some(vector) => vector,
            None => {
                if !self.embedder.ready() {
                    return Ok(vec![]);
                }
                let vector = match self.embedder.embed(&source.content).await {
                    Ok(vector) => vector,
                    Err(e) => {
                        tracing::warn!(error = %e, "source embedding failed");
                        return Ok(vec![]);
                    }
                };
                let record = (content_hash.to_string(), vector.clone(), json!({}));
                if let Err(e) = self.upsert_vectors(&[record]).await {
                    tracing::warn!(error = %e, "late vector upsert failed");
                }
                vector
            }
        };

        let matches = self
            .query_vectors(&vector, n_results.max(MIN_CANDIDATE_POOL) + 1)
            .await?;
        let scores: HashMap<String, f64> = matches
            .iter()
            .filter(|m| m.id != content_hash)
            .map(|m| (m.id.clone(), m.score))
            .collect();
        let ids: Vec<String> = scores.keys().cloned().collect();

        let memories = self.load_memories_by_hashes(&ids).await?;
        let mut results = Vec::with_capacity(memories.len());
        for mut memory in memories {
            self.hydrate_content(&mut memory).await?;
            let score = scores
                .get(&memory.content_hash)
                .copied()
                .unwrap_or(0.0)
                .clamp(0.0, 1.0) as f32;
            results.push(MemoryQueryResult {
                memory,
                similarity_score: score,
                relevance_reason: format!("vector:{score:.4}"),
            });
        }

        query::rank_results(&mut results);
        results.truncate(n_results);
        Ok(results)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let rows = self
            .sql(
                "SELECT content_hash, content, memory_type, created_at, updated_at, \
                 tags_json, metadata_json FROM memories WHERE content_hash = ?",
                vec![json!(content_hash)],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let mut memory = row_to_memory(row)?;
        self.hydrate_content(&mut memory).await?;
        Ok(Some(memory))
    }

    async fn delete(&self, content_hash: &str) -> Result<DeleteOutcome> {
        let rows = self
            .sql(
                "SELECT metadata_json FROM memories WHERE content_hash = ?",
                vec![json!(content_hash)],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(DeleteOutcome {
                deleted: false,
                message: "memory not found".into(),
            });
        };

        // Blob cleanup needs the pointer before the row disappears
        let large_ref = row
            .get("metadata_json")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str::<HashMap<String, Value>>(s).ok())
            .and_then(|m| {
                m.get(META_LARGE_CONTENT_REF)
                    .and_then(Value::as_str)
                    .map(String::from)
            });

        self.sql(
            "DELETE FROM memories WHERE content_hash = ?",
            vec![json!(content_hash)],
        )
        .await?;
        self.sql(
            "DELETE FROM memory_tags WHERE content_hash = ?",
            vec![json!(content_hash)],
        )
        .await?;
        self.sql(
            "DELETE FROM vector_repair WHERE content_hash = ?",
            vec![json!(content_hash)],
        )
        .await?;
        self.delete_vectors(&[content_hash.to_string()]).await?;

        if let (Some(bucket), Some(key)) = (&self.config.object_bucket, large_ref) {
            self.delete_object(bucket, &key).await?;
        }

        Ok(DeleteOutcome {
            deleted: true,
            message: "memory deleted".into(),
        })
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let rows = self
            .sql(
                "SELECT content_hash FROM memory_tags WHERE tag = ?",
                vec![json!(tag)],
            )
            .await?;

        let mut deleted = 0;
        for row in rows {
            if let Some(hash) = row.get("content_hash").and_then(Value::as_str) {
                if self.delete(hash).await?.deleted {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn delete_by_time_range(&self, range: TimeRange) -> Result<usize> {
        let rows = self
            .sql(
                "SELECT content_hash FROM memories WHERE created_at >= ? AND created_at <= ?",
                vec![json!(range.start), json!(range.end)],
            )
            .await?;

        let mut deleted = 0;
        for row in rows {
            if let Some(hash) = row.get("content_hash").and_then(Value::as_str) {
                if self.delete(hash).await?.deleted {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: MetadataPatch,
    ) -> Result<Memory> {
        let Some(mut memory) = self.get_by_hash(content_hash).await? else {
            return Err(MnemoError::NotFound(content_hash.to_string()));
        };

        if let Some(metadata) = patch.metadata {
            for (key, value) in metadata {
                memory.metadata.insert(key, value);
            }
        }
        let replace_tags = patch.tags.is_some();
        if let Some(tags) = patch.tags {
            memory.tags = tags;
        }
        if let Some(memory_type) = patch.memory_type {
            memory.memory_type = memory_type;
        }
        memory.updated_at = identity::now();
        memory.sync_iso_timestamps();

        self.sql(
            "UPDATE memories SET memory_type = ?, updated_at = ?, tags_json = ?, \
             metadata_json = ? WHERE content_hash = ?",
            vec![
                json!(memory.memory_type),
                json!(memory.updated_at),
                json!(serde_json::to_string(&memory.tags)?),
                json!(serde_json::to_string(&memory.metadata)?),
                json!(memory.content_hash),
            ],
        )
        .await?;

        if replace_tags {
            self.sql(
                "DELETE FROM memory_tags WHERE content_hash = ?",
                vec![json!(memory.content_hash)],
            )
            .await?;
            for tag in &memory.tags {
                self.sql(
                    "INSERT INTO memory_tags (content_hash, tag) VALUES (?, ?) \
                     ON CONFLICT(content_hash, tag) DO NOTHING",
                    vec![json!(memory.content_hash), json!(tag)],
                )
                .await?;
            }
        }

        Ok(memory)
    }

    async fn cleanup_duplicates(&self) -> Result<usize> {
        let before = self
            .sql("SELECT COUNT(*) AS n FROM memories", vec![])
            .await?;
        self.sql(
            "DELETE FROM memories WHERE EXISTS (\
               SELECT 1 FROM memories keeper \
               WHERE keeper.content_hash = memories.content_hash \
                 AND (keeper.created_at < memories.created_at \
                      OR (keeper.created_at = memories.created_at \
                          AND keeper.rowid < memories.rowid)))",
            vec![],
        )
        .await?;
        let after = self
            .sql("SELECT COUNT(*) AS n FROM memories", vec![])
            .await?;

        let count = |rows: &[Map<String, Value>]| {
            rows.first()
                .and_then(|r| r.get("n"))
                .and_then(Value::as_i64)
                .unwrap_or(0)
        };
        Ok((count(&before) - count(&after)).max(0) as usize)
    }

    async fn list(&self, offset: usize, limit: usize, filters: &ListFilters) -> Result<ListPage> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(tag) = &filters.tag {
            clauses.push(
                "EXISTS (SELECT 1 FROM memory_tags t WHERE \
                 t.content_hash = memories.content_hash AND t.tag = ?)"
                    .into(),
            );
            params.push(json!(tag));
        }
        if let Some(memory_type) = &filters.memory_type {
            clauses.push("memory_type = ?".into());
            params.push(json!(memory_type));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total_rows = self
            .sql(
                &format!("SELECT COUNT(*) AS n FROM memories {where_clause}"),
                params.clone(),
            )
            .await?;
        let total = total_rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let rows = self
            .sql(
                &format!(
                    "SELECT content_hash, content, memory_type, created_at, updated_at, \
                     tags_json, metadata_json FROM memories {where_clause} \
                     ORDER BY created_at DESC, content_hash ASC LIMIT {limit} OFFSET {offset}"
                ),
                params,
            )
            .await?;
        let memories = rows
            .into_iter()
            .map(row_to_memory)
            .collect::<Result<Vec<_>>>()?;

        Ok(ListPage { memories, total })
    }

    async fn list_tags(&self) -> Result<Vec<(String, i64)>> {
        let rows = self
            .sql(
                "SELECT tag, COUNT(*) AS n FROM memory_tags \
                 GROUP BY tag ORDER BY COUNT(*) DESC, tag ASC",
                vec![],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let tag = row.get("tag")?.as_str()?.to_string();
                let count = row.get("n")?.as_i64()?;
                Some((tag, count))
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let counts = self
            .sql(
                "SELECT (SELECT COUNT(*) FROM memories) AS memories, \
                 (SELECT COUNT(DISTINCT tag) FROM memory_tags) AS tags, \
                 (SELECT COALESCE(SUM(LENGTH(content)), 0) FROM memories) AS bytes, \
                 (SELECT COUNT(*) FROM vector_repair) AS pending_repairs",
                vec![],
            )
            .await?;
        let row = counts.into_iter().next().unwrap_or_default();
        let get = |key: &str| row.get(key).and_then(Value::as_i64).unwrap_or(0);

        let conflict = *self.conflict.lock();
        let mut details = HashMap::new();
        details.insert("vector_index".to_string(), json!(self.config.vector_index));
        details.insert(
            "relational_db".to_string(),
            json!(self.config.relational_db),
        );
        details.insert(
            "pending_vector_repairs".to_string(),
            json!(get("pending_repairs")),
        );
        if let Some(bucket) = &self.config.object_bucket {
            details.insert("object_bucket".to_string(), json!(bucket));
        }
        if let Some((stored, provider)) = conflict {
            details.insert(
                "dimension_mismatch".to_string(),
                json!({ "stored": stored, "provider": provider }),
            );
        }

        Ok(StorageStats {
            backend: "cloud".into(),
            storage_type: "cloud vector index + relational store".into(),
            total_memories: get("memories"),
            total_tags: get("tags"),
            storage_size: human_bytes(get("bytes").max(0) as u64),
            embedding_model: self.embedder.model_name(),
            embedding_dimension: self.embedder.dimension(),
            healthy: conflict.is_none(),
            details,
        })
    }

    fn backend_name(&self) -> &'static str {
        "cloud"
    }
}

fn row_to_memory(row: Map<String, Value>) -> Result<Memory> {
    let get_str = |key: &str| -> Result<String> {
        row.get(key)
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| MnemoError::internal(format!("relational row missing '{key}'")))
    };
    let get_f64 = |key: &str| -> Result<f64> {
        row.get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| MnemoError::internal(format!("relational row missing '{key}'")))
    };

    let mut memory = Memory {
        content_hash: get_str("content_hash")?,
        content: get_str("content")?,
        memory_type: get_str("memory_type")?,
        created_at: get_f64("created_at")?,
        updated_at: get_f64("updated_at")?,
        created_at_iso: String::new(),
        updated_at_iso: String::new(),
        tags: serde_json::from_str(&get_str("tags_json")?)?,
        metadata: serde_json::from_str(&get_str("metadata_json")?)?,
        embedding: None,
    };
    memory.sync_iso_timestamps();
    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::HashedEmbedder;

    fn test_config() -> CloudConfig {
        CloudConfig {
            account: "acct".into(),
            token: "token".into(),
            vector_index: "memories-idx".into(),
            relational_db: "db-id".into(),
            object_bucket: Some("blobs".into()),
            ..CloudConfig::default()
        }
    }

    fn test_backend() -> CloudStorage {
        let provider = Arc::new(HashedEmbedder::new(64));
        let handle = EmbeddingHandle::new(provider, &EmbeddingConfig::default());
        CloudStorage::new(test_config(), handle).unwrap()
    }

    #[test]
    fn url_construction() {
        let backend = test_backend();
        assert_eq!(
            backend.vector_url("/query"),
            "https://api.cloudflare.com/client/v4/accounts/acct/vectorize/v2/indexes/memories-idx/query"
        );
        assert_eq!(
            backend.sql_url(),
            "https://api.cloudflare.com/client/v4/accounts/acct/d1/database/db-id/query"
        );
        assert_eq!(
            backend.object_url("blobs", "abc"),
            "https://api.cloudflare.com/client/v4/accounts/acct/r2/buckets/blobs/objects/abc"
        );
    }

    #[test]
    fn config_validation_rejects_blank() {
        let provider = Arc::new(HashedEmbedder::new(64));
        let handle = EmbeddingHandle::new(provider, &EmbeddingConfig::default());
        let err = CloudStorage::new(CloudConfig::default(), handle).unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn row_mapping() {
        let mut row = Map::new();
        row.insert("content_hash".into(), json!("abc"));
        row.insert("content".into(), json!("text"));
        row.insert("memory_type".into(), json!("note"));
        row.insert("created_at".into(), json!(100.5));
        row.insert("updated_at".into(), json!(101.5));
        row.insert("tags_json".into(), json!("[\"a\"]"));
        row.insert("metadata_json".into(), json!("{}"));

        let memory = row_to_memory(row).unwrap();
        assert_eq!(memory.content_hash, "abc");
        assert_eq!(memory.tags, vec!["a"]);
        assert!(memory.created_at_iso.ends_with('Z'));
    }

    #[test]
    fn row_mapping_missing_column() {
        let row = Map::new();
        assert!(row_to_memory(row).is_err());
    }
}
