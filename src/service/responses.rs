//! Canonical request and response shapes
//!
//! Every transport (stdio RPC, HTTP) serializes exactly these structs, so
//! callers see identical behavior regardless of framing. Inbound shapes
//! reject unknown fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Memory, MemoryQueryResult};

fn default_n_results() -> usize {
    5
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    10
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreMemoryRequest {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Client machine hostname for source tracking
    #[serde(default)]
    pub client_hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieveMemoryRequest {
    pub query: String,
    #[serde(default = "default_n_results")]
    pub n_results: usize,
    #[serde(default)]
    pub min_similarity: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchByTagRequest {
    pub tags: Vec<String>,
    #[serde(default)]
    pub match_all: bool,
}

/// Time search accepts either a natural-language `query` or explicit
/// `start`/`end` bounds (RFC 3339 or epoch seconds/milliseconds).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchByTimeRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_n_results")]
    pub n_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSimilarRequest {
    pub content_hash: String,
    #[serde(default = "default_n_results")]
    pub n_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMemoryMetadataRequest {
    pub content_hash: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub memory_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListMemoriesRequest {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub memory_type: Option<String>,
}

impl Default for ListMemoriesRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
            tag: None,
            memory_type: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteByTagRequest {
    pub tag: String,
}

/// Time-range deletion uses the same grammar as time search.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteByTimeRangeRequest {
    pub query: String,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMemoryResponse {
    pub success: bool,
    /// `false` when the content hash already existed (duplicate no-op)
    pub stored: bool,
    pub message: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveMemoryResponse {
    pub results: Vec<MemoryQueryResult>,
    pub total_found: usize,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchByTagResponse {
    pub results: Vec<Memory>,
    pub search_tags: Vec<String>,
    pub match_all: bool,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchByTimeResponse {
    pub results: Vec<Memory>,
    /// RFC 3339 bounds actually used for the scan
    pub start: String,
    pub end: String,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSimilarResponse {
    pub results: Vec<MemoryQueryResult>,
    pub source_hash: String,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMemoriesResponse {
    pub results: Vec<Memory>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMemoryResponse {
    pub success: bool,
    pub message: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteByTagResponse {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteByTimeRangeResponse {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMemoryMetadataResponse {
    pub success: bool,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTagsResponse {
    pub tags: Vec<TagCount>,
}

/// Error body shared by both transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_request_defaults() {
        let request: StoreMemoryRequest =
            serde_json::from_str(r#"{"content": "hello"}"#).unwrap();
        assert_eq!(request.content, "hello");
        assert!(request.tags.is_empty());
        assert!(request.memory_type.is_none());
    }

    #[test]
    fn unknown_fields_rejected() {
        let result: std::result::Result<RetrieveMemoryRequest, _> =
            serde_json::from_str(r#"{"query": "x", "surprise": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn retrieve_defaults() {
        let request: RetrieveMemoryRequest = serde_json::from_str(r#"{"query": "x"}"#).unwrap();
        assert_eq!(request.n_results, 5);
        assert_eq!(request.min_similarity, 0.0);
    }

    #[test]
    fn list_defaults() {
        let request: ListMemoriesRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.page, 1);
        assert_eq!(request.page_size, 10);
    }

    #[test]
    fn time_request_accepts_either_form() {
        let by_query: SearchByTimeRequest =
            serde_json::from_str(r#"{"query": "yesterday"}"#).unwrap();
        assert_eq!(by_query.query.as_deref(), Some("yesterday"));

        let by_bounds: SearchByTimeRequest =
            serde_json::from_str(r#"{"start": "2024-01-01T00:00:00Z", "end": "1706745600"}"#)
                .unwrap();
        assert!(by_bounds.start.is_some());
        assert!(by_bounds.end.is_some());
    }
}
