//! Core types for mnemo

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MnemoError, Result};
use crate::identity;

/// Content hash — lowercase hex SHA-256 of the content bytes
pub type ContentHash = String;

/// Default memory type when the caller does not specify one
pub const DEFAULT_MEMORY_TYPE: &str = "note";

/// Inline content limit; larger content requires large-object spill
pub const MAX_INLINE_CONTENT_BYTES: usize = 1024 * 1024;

/// Reserved metadata keys
pub const META_HOSTNAME: &str = "hostname";
pub const META_SOURCE: &str = "source";
pub const META_LARGE_CONTENT_REF: &str = "large_content_ref";
pub const META_ORIGINAL_LENGTH: &str = "original_length";

/// A memory entry — a content-addressed, tagged text record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Full text content
    pub content: String,
    /// Lowercase hex SHA-256 of the content bytes (primary identity)
    pub content_hash: ContentHash,
    /// Normalized tags, display order preserved
    #[serde(default)]
    pub tags: Vec<String>,
    /// Memory type label (e.g. "note", "decision", "reminder")
    #[serde(default = "default_memory_type")]
    pub memory_type: String,
    /// Arbitrary scalar metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Creation time, fractional epoch seconds UTC
    pub created_at: f64,
    /// Derived RFC 3339 form of `created_at` — never authoritative
    pub created_at_iso: String,
    /// Last mutation time, fractional epoch seconds UTC
    pub updated_at: f64,
    /// Derived RFC 3339 form of `updated_at`
    pub updated_at_iso: String,
    /// Dense embedding vector; absent until the provider has embedded it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_memory_type() -> String {
    DEFAULT_MEMORY_TYPE.to_string()
}

impl Memory {
    /// Build a normalized memory from raw ingestion input.
    ///
    /// Normalizes tags, trims metadata string values, computes the content
    /// hash, and stamps both timestamps with the current time. Rejects
    /// content that is empty after inspection.
    pub fn new(
        content: impl Into<String>,
        tags: Vec<String>,
        memory_type: Option<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MnemoError::InvalidInput(
                "memory content must not be empty".into(),
            ));
        }

        let now = identity::now();
        Ok(Self {
            content_hash: identity::content_hash(&content),
            content,
            tags: normalize_tags(tags)?,
            memory_type: memory_type.unwrap_or_else(default_memory_type),
            metadata: normalize_metadata(metadata)?,
            created_at: now,
            created_at_iso: identity::timestamp_to_iso(now),
            updated_at: now,
            updated_at_iso: identity::timestamp_to_iso(now),
            embedding: None,
        })
    }

    /// Re-derive the ISO fields from the numeric timestamps.
    pub fn sync_iso_timestamps(&mut self) {
        self.created_at_iso = identity::timestamp_to_iso(self.created_at);
        self.updated_at_iso = identity::timestamp_to_iso(self.updated_at);
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = identity::now();
        self.updated_at_iso = identity::timestamp_to_iso(self.updated_at);
    }

    /// Whether this memory carries a tag (exact match after normalization).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A memory plus its relevance to a semantic query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQueryResult {
    pub memory: Memory,
    /// Similarity in [0, 1]
    pub similarity_score: f32,
    /// Human-readable explanation, e.g. "vector:0.8213"
    pub relevance_reason: String,
}

/// Normalize a single tag: trim outer whitespace, collapse internal
/// whitespace runs to single spaces. Empty tags are rejected.
pub fn normalize_tag(tag: &str) -> Result<String> {
    let collapsed = tag.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(MnemoError::InvalidInput(format!(
            "tag '{tag}' is empty after normalization"
        )));
    }
    Ok(collapsed)
}

/// Normalize a tag list: per-tag normalization plus deduplication,
/// preserving first-seen order for display.
pub fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let normalized = normalize_tag(&tag)?;
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    Ok(out)
}

/// Validate and normalize metadata: values must be scalars (string,
/// number, bool, null); string values are trimmed.
pub fn normalize_metadata(metadata: HashMap<String, Value>) -> Result<HashMap<String, Value>> {
    let mut out = HashMap::with_capacity(metadata.len());
    for (key, value) in metadata {
        let normalized = match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Number(_) | Value::Bool(_) | Value::Null => value,
            Value::Array(_) | Value::Object(_) => {
                return Err(MnemoError::InvalidInput(format!(
                    "metadata value for '{key}' must be a string, number, boolean, or null"
                )));
            }
        };
        out.insert(key, normalized);
    }
    Ok(out)
}

/// Outcome of a store call. Duplicates are normal outcomes, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOutcome {
    /// `false` when the content hash already existed
    pub stored: bool,
    pub message: String,
}

/// Outcome of a delete call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
    pub message: String,
}

/// Patch applied by `update_memory_metadata`
///
/// `metadata` merges key-by-key into the existing map; `tags`, when
/// present, replaces the whole tag set; `memory_type` replaces the label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.tags.is_none() && self.memory_type.is_none()
    }
}

/// Filters accepted by the list operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
}

/// One page of the list operation, ordered by `created_at` descending
/// with `content_hash` ascending tie-break
#[derive(Debug, Clone)]
pub struct ListPage {
    pub memories: Vec<Memory>,
    /// Total matching records before pagination
    pub total: i64,
}

/// Inclusive time range in fractional epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: f64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Uniform statistics shape shared by all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    /// "embedded", "cloud", or "federated"
    pub backend: String,
    /// Human label, e.g. "SQLite with vector index"
    pub storage_type: String,
    pub total_memories: i64,
    pub total_tags: i64,
    /// Human-readable size, e.g. "14.2 MB"
    pub storage_size: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub healthy: bool,
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

/// Render a byte count as a short human-readable string.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_memory_normalizes() {
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), json!("  cli  "));
        let memory = Memory::new(
            "remember this",
            vec!["  rust ".into(), "rust".into(), "a  b".into()],
            None,
            metadata,
        )
        .unwrap();

        assert_eq!(memory.tags, vec!["rust", "a b"]);
        assert_eq!(memory.memory_type, "note");
        assert_eq!(memory.metadata["source"], json!("cli"));
        assert_eq!(memory.content_hash, identity::content_hash("remember this"));
        assert_eq!(memory.created_at, memory.updated_at);
        assert!(memory.created_at_iso.ends_with('Z'));
        assert!(memory.embedding.is_none());
    }

    #[test]
    fn empty_content_rejected() {
        let err = Memory::new("   ", vec![], None, HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn unicode_content_hash_stable() {
        let text = "shipped \u{1f680} release \u{2705}";
        let m1 = Memory::new(text, vec![], None, HashMap::new()).unwrap();
        let m2 = Memory::new(text, vec![], None, HashMap::new()).unwrap();
        assert_eq!(m1.content_hash, m2.content_hash);
        assert_eq!(m1.content, text);
    }

    #[test]
    fn tag_normalization() {
        assert_eq!(normalize_tag("  hello   world  ").unwrap(), "hello world");
        assert!(normalize_tag("   ").is_err());
        assert_eq!(normalize_tag("CamelCase").unwrap(), "CamelCase");
    }

    #[test]
    fn tags_dedupe_preserving_order() {
        let tags = normalize_tags(vec!["b".into(), "a".into(), " b ".into()]).unwrap();
        assert_eq!(tags, vec!["b", "a"]);
    }

    #[test]
    fn metadata_rejects_nested_values() {
        let mut metadata = HashMap::new();
        metadata.insert("nested".to_string(), json!({"a": 1}));
        assert!(normalize_metadata(metadata).is_err());

        let mut metadata = HashMap::new();
        metadata.insert("list".to_string(), json!([1, 2]));
        assert!(normalize_metadata(metadata).is_err());
    }

    #[test]
    fn metadata_accepts_scalars() {
        let mut metadata = HashMap::new();
        metadata.insert("count".to_string(), json!(3));
        metadata.insert("flag".to_string(), json!(true));
        metadata.insert("none".to_string(), Value::Null);
        let out = normalize_metadata(metadata).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn touch_bumps_updated_at() {
        let mut memory = Memory::new("x", vec![], None, HashMap::new()).unwrap();
        let before = memory.updated_at;
        memory.touch();
        assert!(memory.updated_at >= before);
        assert!(memory.created_at <= memory.updated_at);
    }

    #[test]
    fn human_bytes_formatting() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KB");
        assert_eq!(human_bytes(14_890_000), "14.2 MB");
    }

    #[test]
    fn memory_serde_skips_absent_embedding() {
        let memory = Memory::new("serde check", vec![], None, HashMap::new()).unwrap();
        let json = serde_json::to_value(&memory).unwrap();
        assert!(json.get("embedding").is_none());
        assert!(json.get("created_at_iso").is_some());
    }

    #[test]
    fn time_range_inclusive() {
        let range = TimeRange::new(10.0, 20.0);
        assert!(range.contains(10.0));
        assert!(range.contains(20.0));
        assert!(!range.contains(20.000001));
    }
}
