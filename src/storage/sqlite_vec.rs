//! Embedded SQLite storage backend with a sqlite-vec vector index
//!
//! One database file holds everything: the `memories` table, the
//! `memory_tags` join table, and a `vec0` virtual table for embeddings
//! keyed by content hash. WAL mode gives one writer and many readers
//! across processes. All rusqlite work runs on the blocking pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::config::EmbeddedConfig;
use crate::embedding::{distance_to_similarity, EmbeddingHandle};
use crate::error::{MnemoError, Result};
use crate::identity;
use crate::query::{self, MIN_CANDIDATE_POOL};
use crate::storage::MemoryStorage;
use crate::types::{
    human_bytes, DeleteOutcome, ListFilters, ListPage, Memory, MemoryQueryResult, MetadataPatch,
    StorageStats, StoreOutcome, TimeRange,
};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call repeatedly.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

const MEMORY_COLUMNS: &str =
    "content_hash, content, memory_type, created_at, updated_at, tags_json, metadata_json";

/// How many missing vectors a single semantic read will backfill
const LATE_EMBED_BATCH: usize = 256;

const META_KEY_MODEL: &str = "embedding_model";
const META_KEY_DIMENSION: &str = "embedding_dimension";

/// Recorded when `initialize` finds vectors of a different width than the
/// provider produces. Writes and semantic reads refuse while set.
#[derive(Debug, Clone, Copy)]
struct DimensionConflict {
    stored: usize,
    provider: usize,
}

/// Embedded storage backend
pub struct SqliteVecStorage {
    conn: Arc<Mutex<Connection>>,
    embedder: EmbeddingHandle,
    path: String,
    conflict: Arc<Mutex<Option<DimensionConflict>>>,
}

impl SqliteVecStorage {
    /// Open (or create) the database at the configured path.
    pub fn open(config: &EmbeddedConfig, embedder: EmbeddingHandle) -> Result<Self> {
        load_sqlite_vec();

        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(&config.path)?
        };

        apply_pragmas(&conn, config)?;
        init_schema(&conn, embedder.dimension())?;
        tracing::info!(path = %config.path, "embedded database ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            path: config.path.clone(),
            conflict: Arc::new(Mutex::new(None)),
        })
    }

    /// In-memory database, useful for tests.
    pub fn open_in_memory(embedder: EmbeddingHandle) -> Result<Self> {
        Self::open(
            &EmbeddedConfig {
                path: ":memory:".into(),
                ..EmbeddedConfig::default()
            },
            embedder,
        )
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| MnemoError::internal(format!("storage task panicked: {e}")))?
    }

    fn ensure_dimension_ok(&self) -> Result<()> {
        if let Some(conflict) = *self.conflict.lock() {
            return Err(MnemoError::DimensionMismatch {
                stored: conflict.stored,
                provider: conflict.provider,
            });
        }
        Ok(())
    }

    /// Embed rows that were stored while the provider was unavailable.
    async fn backfill_missing_vectors(&self) -> Result<()> {
        if !self.embedder.ready() {
            return Ok(());
        }

        let pending: Vec<(String, String)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.content_hash, m.content FROM memories m \
                     WHERE NOT EXISTS (SELECT 1 FROM memory_vectors v \
                                       WHERE v.content_hash = m.content_hash) \
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![LATE_EMBED_BATCH as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        if pending.is_empty() {
            return Ok(());
        }

        let contents: Vec<String> = pending.iter().map(|(_, c)| c.clone()).collect();
        let embeddings = match self.embedder.embed_batch(contents).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(error = %e, "late embedding failed; records stay unindexed");
                return Ok(());
            }
        };

        let count = pending.len();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for ((hash, _), embedding) in pending.into_iter().zip(embeddings) {
                tx.execute(
                    "INSERT OR IGNORE INTO memory_vectors (content_hash, embedding) VALUES (?1, ?2)",
                    params![hash, embedding_to_bytes(&embedding)],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!(count, "backfilled missing vectors");
        Ok(())
    }

    /// KNN over the vector table, mapped back into ranked query results.
    async fn nearest_neighbors(
        &self,
        embedding: Vec<f32>,
        n_results: usize,
        exclude_hash: Option<String>,
    ) -> Result<Vec<MemoryQueryResult>> {
        let pool = n_results.max(MIN_CANDIDATE_POOL) + usize::from(exclude_hash.is_some());
        let mut results = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT content_hash, distance FROM memory_vectors \
                     WHERE embedding MATCH ?1 ORDER BY distance LIMIT {pool}"
                ))?;
                let candidates = stmt
                    .query_map(params![embedding_to_bytes(&embedding)], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<(String, f64)>, _>>()?;

                let mut results = Vec::with_capacity(candidates.len());
                for (hash, distance) in candidates {
                    if exclude_hash.as_deref() == Some(hash.as_str()) {
                        continue;
                    }
                    if let Some(memory) = load_memory(conn, &hash)? {
                        let score = distance_to_similarity(distance);
                        results.push(MemoryQueryResult {
                            memory,
                            similarity_score: score,
                            relevance_reason: format!("vector:{score:.4}"),
                        });
                    }
                }
                Ok(results)
            })
            .await?;

        query::rank_results(&mut results);
        results.truncate(n_results);
        Ok(results)
    }
}

#[async_trait]
impl MemoryStorage for SqliteVecStorage {
    async fn initialize(&self) -> Result<()> {
        let provider_dim = self.embedder.dimension();
        let model = self.embedder.model_name();
        let conflict_slot = self.conflict.clone();

        self.with_conn(move |conn| {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT value FROM store_meta WHERE key = ?1",
                    params![META_KEY_DIMENSION],
                    |row| row.get(0),
                )
                .optional()?;

            match stored.and_then(|s| s.parse::<usize>().ok()) {
                Some(stored_dim) if stored_dim != provider_dim => {
                    *conflict_slot.lock() = Some(DimensionConflict {
                        stored: stored_dim,
                        provider: provider_dim,
                    });
                    Err(MnemoError::DimensionMismatch {
                        stored: stored_dim,
                        provider: provider_dim,
                    })
                }
                Some(_) => Ok(()),
                None => {
                    conn.execute(
                        "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2), (?3, ?4)",
                        params![
                            META_KEY_DIMENSION,
                            provider_dim.to_string(),
                            META_KEY_MODEL,
                            model
                        ],
                    )?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn store(&self, memory: Memory) -> Result<StoreOutcome> {
        self.ensure_dimension_ok()?;

        // The embedded backend has no large-object spill
        if memory.content.len() > crate::types::MAX_INLINE_CONTENT_BYTES {
            return Err(MnemoError::InvalidInput(format!(
                "content exceeds {} bytes",
                crate::types::MAX_INLINE_CONTENT_BYTES
            )));
        }

        let hash = memory.content_hash.clone();
        let exists: bool = self
            .with_conn(move |conn| {
                let found: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM memories WHERE content_hash = ?1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await?;
        if exists {
            return Ok(StoreOutcome {
                stored: false,
                message: "duplicate".into(),
            });
        }

        // Embed before the transaction; a not-ready or failing provider
        // leaves the vector for late embedding. Backpressure still fails
        // the write.
        let embedding = if self.embedder.ready() {
            match self.embedder.embed(&memory.content).await {
                Ok(vector) => Some(vector),
                Err(e @ MnemoError::ResourceExhausted(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed; storing without vector");
                    None
                }
            }
        } else {
            None
        };

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO memories (content_hash, content, memory_type, created_at, \
                 updated_at, tags_json, metadata_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(content_hash) DO NOTHING",
                params![
                    memory.content_hash,
                    memory.content,
                    memory.memory_type,
                    memory.created_at,
                    memory.updated_at,
                    serde_json::to_string(&memory.tags)?,
                    serde_json::to_string(&memory.metadata)?,
                ],
            )?;
            if inserted == 0 {
                // Lost a race with another writer; still a success
                tx.commit()?;
                return Ok(StoreOutcome {
                    stored: false,
                    message: "duplicate".into(),
                });
            }

            for tag in &memory.tags {
                tx.execute(
                    "INSERT OR IGNORE INTO memory_tags (content_hash, tag) VALUES (?1, ?2)",
                    params![memory.content_hash, tag],
                )?;
            }

            if let Some(vector) = embedding {
                tx.execute(
                    "INSERT INTO memory_vectors (content_hash, embedding) VALUES (?1, ?2)",
                    params![memory.content_hash, embedding_to_bytes(&vector)],
                )?;
            }

            tx.commit()?;
            Ok(StoreOutcome {
                stored: true,
                message: "memory stored".into(),
            })
        })
        .await
    }

    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        self.ensure_dimension_ok()?;

        if !self.embedder.ready() {
            tracing::warn!("embedding provider unavailable; semantic search degraded");
            return Ok(vec![]);
        }

        self.backfill_missing_vectors().await?;

        let embedding = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; returning empty result");
                return Ok(vec![]);
            }
        };

        self.nearest_neighbors(embedding, n_results, None).await
    }

    async fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>> {
        if tags.is_empty() {
            return Ok(vec![]);
        }

        let tags = tags.to_vec();
        self.with_conn(move |conn| {
            let placeholders = placeholders(tags.len());
            let sql = if match_all {
                format!(
                    "SELECT m.rowid FROM memories m JOIN memory_tags t \
                     ON t.content_hash = m.content_hash \
                     WHERE t.tag IN ({placeholders}) \
                     GROUP BY m.content_hash HAVING COUNT(DISTINCT t.tag) = ?{} \
                     ORDER BY m.created_at DESC, m.content_hash ASC",
                    tags.len() + 1
                )
            } else {
                format!(
                    "SELECT DISTINCT m.rowid FROM memories m JOIN memory_tags t \
                     ON t.content_hash = m.content_hash \
                     WHERE t.tag IN ({placeholders}) \
                     ORDER BY m.created_at DESC, m.content_hash ASC"
                )
            };

            let mut values: Vec<Box<dyn rusqlite::ToSql>> = tags
                .iter()
                .map(|t| Box::new(t.clone()) as Box<dyn rusqlite::ToSql>)
                .collect();
            if match_all {
                values.push(Box::new(tags.len() as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rowids = stmt
                .query_map(
                    rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                    |row| row.get::<_, i64>(0),
                )?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            drop(stmt);

            let mut memories = Vec::with_capacity(rowids.len());
            for rowid in rowids {
                if let Some(memory) = load_memory_by_rowid(conn, rowid)? {
                    memories.push(memory);
                }
            }
            Ok(memories)
        })
        .await
    }

    async fn search_by_time(&self, range: TimeRange, n_results: usize) -> Result<Vec<Memory>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories \
                 WHERE created_at >= ?1 AND created_at <= ?2 \
                 ORDER BY created_at DESC, content_hash ASC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![range.start, range.end, n_results as i64], row_parts)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(parts_to_memory).collect()
        })
        .await
    }

    async fn search_similar_to(
        &self,
        content_hash: &str,
        n_results: usize,
    ) -> Result<Vec<MemoryQueryResult>> {
        self.ensure_dimension_ok()?;

        let hash = content_hash.to_string();
        let source: Option<(String, Option<Vec<u8>>)> = self
            .with_conn(move |conn| {
                let content: Option<String> = conn
                    .query_row(
                        "SELECT content FROM memories WHERE content_hash = ?1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(content) = content else {
                    return Ok(None);
                };
                let vector: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT embedding FROM memory_vectors WHERE content_hash = ?1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(Some((content, vector)))
            })
            .await?;

        let Some((content, stored_vector)) = source else {
            return Err(MnemoError::NotFound(content_hash.to_string()));
        };

        let embedding = match stored_vector {
            Some(bytes) => bytes_to_embedding(&bytes),
            None => {
                // Late-embed the source record so it can anchor the search
                if !self.embedder.ready() {
                    return Ok(vec![]);
                }
                let vector = match self.embedder.embed(&content).await {
                    Ok(vector) => vector,
                    Err(e) => {
                        tracing::warn!(error = %e, "source embedding failed");
                        return Ok(vec![]);
                    }
                };
                let hash = content_hash.to_string();
                let bytes = embedding_to_bytes(&vector);
                self.with_conn(move |conn| {
                    conn.execute(
                        "INSERT OR IGNORE INTO memory_vectors (content_hash, embedding) \
                         VALUES (?1, ?2)",
                        params![hash, bytes],
                    )?;
                    Ok(())
                })
                .await?;
                vector
            }
        };

        self.nearest_neighbors(embedding, n_results, Some(content_hash.to_string()))
            .await
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let hash = content_hash.to_string();
        self.with_conn(move |conn| load_memory(conn, &hash)).await
    }

    async fn delete(&self, content_hash: &str) -> Result<DeleteOutcome> {
        let hash = content_hash.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM memories WHERE content_hash = ?1", params![hash])?;
            tx.execute(
                "DELETE FROM memory_tags WHERE content_hash = ?1",
                params![hash],
            )?;
            tx.execute(
                "DELETE FROM memory_vectors WHERE content_hash = ?1",
                params![hash],
            )?;
            tx.commit()?;

            Ok(if removed > 0 {
                DeleteOutcome {
                    deleted: true,
                    message: "memory deleted".into(),
                }
            } else {
                DeleteOutcome {
                    deleted: false,
                    message: "memory not found".into(),
                }
            })
        })
        .await
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        let tag = tag.to_string();
        let hashes: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT content_hash FROM memory_tags WHERE tag = ?1")?;
                let rows = stmt
                    .query_map(params![tag], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut deleted = 0;
        for hash in hashes {
            if self.delete(&hash).await?.deleted {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_by_time_range(&self, range: TimeRange) -> Result<usize> {
        let hashes: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT content_hash FROM memories \
                     WHERE created_at >= ?1 AND created_at <= ?2",
                )?;
                let rows = stmt
                    .query_map(params![range.start, range.end], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut deleted = 0;
        for hash in hashes {
            if self.delete(&hash).await?.deleted {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        patch: MetadataPatch,
    ) -> Result<Memory> {
        let hash = content_hash.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut memory) = load_memory(&tx, &hash)? else {
                return Err(MnemoError::NotFound(hash));
            };

            if let Some(metadata) = patch.metadata {
                for (key, value) in metadata {
                    memory.metadata.insert(key, value);
                }
            }
            if let Some(tags) = patch.tags {
                memory.tags = tags;
                tx.execute(
                    "DELETE FROM memory_tags WHERE content_hash = ?1",
                    params![memory.content_hash],
                )?;
                for tag in &memory.tags {
                    tx.execute(
                        "INSERT OR IGNORE INTO memory_tags (content_hash, tag) VALUES (?1, ?2)",
                        params![memory.content_hash, tag],
                    )?;
                }
            }
            if let Some(memory_type) = patch.memory_type {
                memory.memory_type = memory_type;
            }
            memory.updated_at = identity::now();
            memory.sync_iso_timestamps();

            tx.execute(
                "UPDATE memories SET memory_type = ?1, updated_at = ?2, tags_json = ?3, \
                 metadata_json = ?4 WHERE content_hash = ?5",
                params![
                    memory.memory_type,
                    memory.updated_at,
                    serde_json::to_string(&memory.tags)?,
                    serde_json::to_string(&memory.metadata)?,
                    memory.content_hash,
                ],
            )?;
            tx.commit()?;
            Ok(memory)
        })
        .await
    }

    async fn cleanup_duplicates(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            // Keep the earliest created_at per hash (rowid breaks ties)
            let removed = tx.execute(
                "DELETE FROM memories WHERE EXISTS (\
                   SELECT 1 FROM memories keeper \
                   WHERE keeper.content_hash = memories.content_hash \
                     AND (keeper.created_at < memories.created_at \
                          OR (keeper.created_at = memories.created_at \
                              AND keeper.rowid < memories.rowid)))",
                [],
            )?;
            tx.execute(
                "DELETE FROM memory_tags WHERE content_hash NOT IN \
                 (SELECT content_hash FROM memories)",
                [],
            )?;
            tx.execute(
                "DELETE FROM memory_vectors WHERE content_hash NOT IN \
                 (SELECT content_hash FROM memories)",
                [],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn list(&self, offset: usize, limit: usize, filters: &ListFilters) -> Result<ListPage> {
        let filters = filters.clone();
        self.with_conn(move |conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(tag) = &filters.tag {
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM memory_tags t WHERE \
                     t.content_hash = memories.content_hash AND t.tag = ?{})",
                    values.len() + 1
                ));
                values.push(Box::new(tag.clone()));
            }
            if let Some(memory_type) = &filters.memory_type {
                clauses.push(format!("memory_type = ?{}", values.len() + 1));
                values.push(Box::new(memory_type.clone()));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM memories {where_clause}"),
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories {where_clause} \
                 ORDER BY created_at DESC, content_hash ASC LIMIT {limit} OFFSET {offset}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                    row_parts,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let memories = rows
                .into_iter()
                .map(parts_to_memory)
                .collect::<Result<Vec<_>>>()?;

            Ok(ListPage { memories, total })
        })
        .await
    }

    async fn list_tags(&self) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tag, COUNT(*) FROM memory_tags \
                 GROUP BY tag ORDER BY COUNT(*) DESC, tag ASC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let conflict = *self.conflict.lock();
        let model = self.embedder.model_name();
        let dimension = self.embedder.dimension();
        let ready = self.embedder.ready();
        let path = self.path.clone();

        self.with_conn(move |conn| {
            let total_memories: i64 =
                conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            let total_tags: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT tag) FROM memory_tags",
                [],
                |row| row.get(0),
            )?;
            let vector_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM memory_vectors", [], |row| row.get(0))?;

            let page_count: i64 =
                conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
            let journal_mode: String =
                conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?;
            let vec_version: String =
                conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;

            let mut details = HashMap::new();
            details.insert("path".to_string(), json!(path));
            details.insert("journal_mode".to_string(), json!(journal_mode));
            details.insert("vector_index_version".to_string(), json!(vec_version));
            details.insert("vector_count".to_string(), json!(vector_count));
            details.insert("embedding_ready".to_string(), json!(ready));
            if let Some(conflict) = conflict {
                details.insert(
                    "dimension_mismatch".to_string(),
                    json!({
                        "stored": conflict.stored,
                        "provider": conflict.provider,
                    }),
                );
            }

            Ok(StorageStats {
                backend: "embedded".into(),
                storage_type: "SQLite with vector index".into(),
                total_memories,
                total_tags,
                storage_size: human_bytes((page_count * page_size).max(0) as u64),
                embedding_model: model,
                embedding_dimension: dimension,
                healthy: conflict.is_none(),
                details,
            })
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "embedded"
    }
}

fn apply_pragmas(conn: &Connection, config: &EmbeddedConfig) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", config.busy_timeout_ms.to_string())?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", "-64000")?;

    if let Some(overrides) = &config.pragma_overrides {
        for entry in overrides.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                MnemoError::Config(format!("pragma override '{entry}' is not key=value"))
            })?;
            conn.pragma_update(None, key.trim(), value.trim())?;
        }
    }
    Ok(())
}

fn init_schema(conn: &Connection, dimension: usize) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            content_hash TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            memory_type TEXT NOT NULL DEFAULT 'note',
            created_at REAL NOT NULL,
            updated_at REAL NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);

        CREATE TABLE IF NOT EXISTS memory_tags (
            content_hash TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (content_hash, tag)
        );
        CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag);

        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    // vec0 virtual tables need their own statement (sqlite-vec syntax)
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_vectors USING vec0(
            content_hash TEXT PRIMARY KEY,
            embedding FLOAT[{dimension}]
        );"
    ))?;

    Ok(())
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert an f32 embedding to the little-endian byte form sqlite-vec expects.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

type MemoryRowParts = (String, String, String, f64, f64, String, String);

fn row_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parts_to_memory(parts: MemoryRowParts) -> Result<Memory> {
    let (content_hash, content, memory_type, created_at, updated_at, tags_json, metadata_json) =
        parts;
    let mut memory = Memory {
        content_hash,
        content,
        memory_type,
        created_at,
        updated_at,
        created_at_iso: String::new(),
        updated_at_iso: String::new(),
        tags: serde_json::from_str(&tags_json)?,
        metadata: serde_json::from_str(&metadata_json)?,
        embedding: None,
    };
    memory.sync_iso_timestamps();
    Ok(memory)
}

fn load_memory(conn: &Connection, content_hash: &str) -> Result<Option<Memory>> {
    let parts = conn
        .query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE content_hash = ?1"),
            params![content_hash],
            row_parts,
        )
        .optional()?;
    parts.map(parts_to_memory).transpose()
}

fn load_memory_by_rowid(conn: &Connection, rowid: i64) -> Result<Option<Memory>> {
    let parts = conn
        .query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE rowid = ?1"),
            params![rowid],
            row_parts,
        )
        .optional()?;
    parts.map(parts_to_memory).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{EmbeddingHandle, HashedEmbedder};

    fn test_storage() -> SqliteVecStorage {
        let provider = Arc::new(HashedEmbedder::new(64));
        let handle = EmbeddingHandle::new(provider, &EmbeddingConfig::default());
        SqliteVecStorage::open_in_memory(handle).unwrap()
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
    async fn store_and_get_round_trip() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let m = memory("the quick brown fox", &["animals", "speed"]);
        let hash = m.content_hash.clone();

        let outcome = storage.store(m).await.unwrap();
        assert!(outcome.stored);

        let loaded = storage.get_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(loaded.content, "the quick brown fox");
        assert_eq!(loaded.tags, vec!["animals", "speed"]);
        assert_eq!(loaded.memory_type, "note");
    }

    #[tokio::test]
    async fn duplicate_store_is_noop() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let first = storage.store(memory("hello world", &[])).await.unwrap();
        let second = storage.store(memory("hello world", &[])).await.unwrap();
        assert!(first.stored);
        assert!(!second.stored);
        assert_eq!(second.message, "duplicate");

        let page = storage.list(0, 10, &ListFilters::default()).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn retrieve_finds_semantically_close_content() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        storage
            .store(memory("fixed the race condition with a mutex", &["bug"]))
            .await
            .unwrap();
        storage
            .store(memory("grocery list: apples and oranges", &[]))
            .await
            .unwrap();

        let results = storage
            .retrieve("race condition fixed with mutex", 2)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(
            results[0].memory.content,
            "fixed the race condition with a mutex"
        );
        assert!(results[0].similarity_score > 0.0);
        assert!(results[0].relevance_reason.starts_with("vector:"));
    }

    #[tokio::test]
    async fn tag_search_and_vs_or() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        storage.store(memory("memory a", &["x", "y"])).await.unwrap();
        storage.store(memory("memory b", &["x"])).await.unwrap();
        storage.store(memory("memory c", &["y"])).await.unwrap();

        let both = storage
            .search_by_tag(&["x".into(), "y".into()], true)
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].content, "memory a");

        let either = storage
            .search_by_tag(&["x".into(), "y".into()], false)
            .await
            .unwrap();
        assert_eq!(either.len(), 3);
    }

    #[tokio::test]
    async fn time_search_inclusive_bounds() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let mut early = memory("early record", &[]);
        early.created_at = 1000.0;
        early.sync_iso_timestamps();
        let mut late = memory("late record", &[]);
        late.created_at = 2000.0;
        late.sync_iso_timestamps();

        storage.store(early).await.unwrap();
        storage.store(late).await.unwrap();

        let hits = storage
            .search_by_time(TimeRange::new(1000.0, 1500.0), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "early record");

        let all = storage
            .search_by_time(TimeRange::new(1000.0, 2000.0), 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].content, "late record");
    }

    #[tokio::test]
    async fn similar_to_excludes_source() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let a = memory("rust ownership and borrowing rules", &[]);
        let hash = a.content_hash.clone();
        storage.store(a).await.unwrap();
        storage
            .store(memory("rust borrowing rules explained", &[]))
            .await
            .unwrap();
        storage
            .store(memory("banana bread recipe", &[]))
            .await
            .unwrap();

        let similar = storage.search_similar_to(&hash, 5).await.unwrap();
        assert!(!similar.is_empty());
        assert!(similar.iter().all(|r| r.memory.content_hash != hash));
        assert_eq!(
            similar[0].memory.content,
            "rust borrowing rules explained"
        );
    }

    #[tokio::test]
    async fn similar_to_unknown_hash_is_not_found() {
        let storage = test_storage();
        storage.initialize().await.unwrap();
        let err = storage.search_similar_to("deadbeef", 5).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn delete_cascades() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let m = memory("to be deleted", &["doomed"]);
        let hash = m.content_hash.clone();
        storage.store(m).await.unwrap();

        let outcome = storage.delete(&hash).await.unwrap();
        assert!(outcome.deleted);

        assert!(storage.get_by_hash(&hash).await.unwrap().is_none());
        assert!(storage
            .search_by_tag(&["doomed".into()], false)
            .await
            .unwrap()
            .is_empty());
        let results = storage.retrieve("to be deleted", 5).await.unwrap();
        assert!(results.iter().all(|r| r.memory.content_hash != hash));

        let again = storage.delete(&hash).await.unwrap();
        assert!(!again.deleted);
    }

    #[tokio::test]
    async fn delete_by_tag_counts() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        storage.store(memory("one", &["temp"])).await.unwrap();
        storage.store(memory("two", &["temp", "keep"])).await.unwrap();
        storage.store(memory("three", &["keep"])).await.unwrap();

        let deleted = storage.delete_by_tag("temp").await.unwrap();
        assert_eq!(deleted, 2);

        let page = storage.list(0, 10, &ListFilters::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.memories[0].content, "three");
    }

    #[tokio::test]
    async fn update_metadata_merges_and_replaces_tags() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let mut m = memory("mutable record", &["old"]);
        m.metadata.insert("keep".into(), json!("yes"));
        let hash = m.content_hash.clone();
        storage.store(m).await.unwrap();

        let patch = MetadataPatch {
            metadata: Some(HashMap::from([("extra".to_string(), json!(42))])),
            tags: Some(vec!["new".into()]),
            memory_type: Some("decision".into()),
        };
        let updated = storage.update_memory_metadata(&hash, patch).await.unwrap();

        assert_eq!(updated.metadata["keep"], json!("yes"));
        assert_eq!(updated.metadata["extra"], json!(42));
        assert_eq!(updated.tags, vec!["new"]);
        assert_eq!(updated.memory_type, "decision");
        assert!(updated.updated_at >= updated.created_at);

        // Tag rows follow the replacement
        assert!(storage
            .search_by_tag(&["old".into()], false)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            storage
                .search_by_tag(&["new".into()], false)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn update_metadata_unknown_hash() {
        let storage = test_storage();
        storage.initialize().await.unwrap();
        let err = storage
            .update_memory_metadata("missing", MetadataPatch::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn list_pagination_is_stable() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        for i in 0..7 {
            let mut m = memory(&format!("record {i}"), &[]);
            m.created_at = 1000.0 + i as f64;
            m.sync_iso_timestamps();
            storage.store(m).await.unwrap();
        }

        let mut seen = Vec::new();
        for page in 0..4 {
            let result = storage
                .list(page * 2, 2, &ListFilters::default())
                .await
                .unwrap();
            assert_eq!(result.total, 7);
            seen.extend(result.memories.into_iter().map(|m| m.content));
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], "record 6");
        assert_eq!(seen[6], "record 0");
    }

    #[tokio::test]
    async fn list_filters_by_tag_and_type() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        let mut m1 = memory("tagged note", &["work"]);
        m1.memory_type = "note".into();
        storage.store(m1).await.unwrap();
        let mut m2 = memory("tagged decision", &["work"]);
        m2.memory_type = "decision".into();
        storage.store(m2).await.unwrap();
        storage.store(memory("untagged", &[])).await.unwrap();

        let filters = ListFilters {
            tag: Some("work".into()),
            memory_type: Some("decision".into()),
        };
        let page = storage.list(0, 10, &filters).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.memories[0].content, "tagged decision");
    }

    #[tokio::test]
    async fn list_tags_with_counts() {
        let storage = test_storage();
        storage.initialize().await.unwrap();

        storage.store(memory("a", &["common", "rare"])).await.unwrap();
        storage.store(memory("b", &["common"])).await.unwrap();

        let tags = storage.list_tags().await.unwrap();
        assert_eq!(tags[0], ("common".to_string(), 2));
        assert_eq!(tags[1], ("rare".to_string(), 1));
    }

    #[tokio::test]
    async fn stats_shape() {
        let storage = test_storage();
        storage.initialize().await.unwrap();
        storage.store(memory("counted", &["t"])).await.unwrap();

        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.backend, "embedded");
        assert_eq!(stats.total_memories, 1);
        assert_eq!(stats.total_tags, 1);
        assert_eq!(stats.embedding_model, "hashed-tfidf");
        assert_eq!(stats.embedding_dimension, 64);
        assert!(stats.healthy);
        assert!(!stats.storage_size.is_empty());
    }

    #[tokio::test]
    async fn cleanup_duplicates_reports_zero_on_clean_store() {
        let storage = test_storage();
        storage.initialize().await.unwrap();
        storage.store(memory("only one", &[])).await.unwrap();
        assert_eq!(storage.cleanup_duplicates().await.unwrap(), 0);
    }

    #[test]
    fn embedding_byte_round_trip() {
        let original = vec![0.5f32, -1.25, 3.75, 0.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }
}
