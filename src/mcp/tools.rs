//! Tool definitions and dispatch for the stdio transport

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::protocol::{
    methods, InitializeResult, McpHandler, McpRequest, McpResponse, ToolCallResult, ToolDefinition,
};
use crate::error::{MnemoError, Result};
use crate::service::{
    DeleteByTagRequest, DeleteByTimeRangeRequest, ListMemoriesRequest, MemoryService,
    RetrieveMemoryRequest, SearchByTagRequest, SearchByTimeRequest, SearchSimilarRequest,
    StoreMemoryRequest, UpdateMemoryMetadataRequest,
};

/// All tool definitions: (name, description, input schema)
const TOOL_DEFINITIONS: &[(&str, &str, &str)] = &[
    (
        "store_memory",
        "Store a new memory with optional tags, type, and metadata",
        r#"{
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The memory content to store"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Tags for categorization"},
                "memory_type": {"type": "string", "default": "note", "description": "Memory type label (e.g. 'note', 'decision', 'reminder')"},
                "metadata": {"type": "object", "description": "Additional scalar metadata"},
                "client_hostname": {"type": "string", "description": "Client machine hostname for source tracking"}
            },
            "required": ["content"]
        }"#,
    ),
    (
        "retrieve_memory",
        "Search memories by semantic similarity to a query",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Natural language search query"},
                "n_results": {"type": "integer", "default": 5, "minimum": 1},
                "min_similarity": {"type": "number", "default": 0.0, "minimum": 0, "maximum": 1}
            },
            "required": ["query"]
        }"#,
    ),
    (
        "search_by_tag",
        "Find memories by tags; match_all requires every tag",
        r#"{
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}},
                "match_all": {"type": "boolean", "default": false}
            },
            "required": ["tags"]
        }"#,
    ),
    (
        "search_by_time",
        "Find memories by creation time: natural language or explicit bounds",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "e.g. 'yesterday', 'last week', 'between 2024-01-01 and 2024-02-01'"},
                "start": {"type": "string", "description": "RFC 3339 or epoch seconds/milliseconds"},
                "end": {"type": "string", "description": "RFC 3339 or epoch seconds/milliseconds"},
                "n_results": {"type": "integer", "default": 5, "minimum": 1}
            }
        }"#,
    ),
    (
        "search_similar",
        "Find memories similar to an existing one by content hash",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string"},
                "n_results": {"type": "integer", "default": 5, "minimum": 1}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "get_memory",
        "Fetch one memory by its content hash",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string"}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "delete_memory",
        "Delete a memory by content hash",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string"}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "delete_by_tag",
        "Delete every memory carrying a tag; returns the count",
        r#"{
            "type": "object",
            "properties": {
                "tag": {"type": "string"}
            },
            "required": ["tag"]
        }"#,
    ),
    (
        "delete_by_time_range",
        "Delete memories created in a time range; same grammar as search_by_time",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "e.g. 'before 2024-01-01', 'last month'"}
            },
            "required": ["query"]
        }"#,
    ),
    (
        "update_memory_metadata",
        "Merge metadata, replace tags, or change the type of a memory",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string"},
                "metadata": {"type": "object", "description": "Keys merged into existing metadata"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Replaces the whole tag set when present"},
                "memory_type": {"type": "string"}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "list_memories",
        "List memories with pagination and optional tag/type filters",
        r#"{
            "type": "object",
            "properties": {
                "page": {"type": "integer", "default": 1, "minimum": 1},
                "page_size": {"type": "integer", "default": 10, "minimum": 1, "maximum": 100},
                "tag": {"type": "string"},
                "memory_type": {"type": "string"}
            }
        }"#,
    ),
    (
        "list_tags",
        "List all tags with usage counts",
        r#"{"type": "object", "properties": {}}"#,
    ),
    (
        "check_database_health",
        "Check the health and statistics of the memory store",
        r#"{"type": "object", "properties": {}}"#,
    ),
];

/// Parse the static definitions into wire shapes.
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    TOOL_DEFINITIONS
        .iter()
        .map(|(name, description, schema)| ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::from_str(schema).expect("tool schema is valid JSON"),
        })
        .collect()
}

/// Stdio request handler backed by the unified service
pub struct MemoryToolHandler {
    service: Arc<MemoryService>,
}

impl MemoryToolHandler {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self { service }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        match name {
            "store_memory" => {
                let request: StoreMemoryRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.store_memory(request, None).await?,
                )?)
            }
            "retrieve_memory" => {
                let request: RetrieveMemoryRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.retrieve_memory(request).await?,
                )?)
            }
            "search_by_tag" => {
                let request: SearchByTagRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.search_by_tag(request).await?,
                )?)
            }
            "search_by_time" => {
                let request: SearchByTimeRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.search_by_time(request).await?,
                )?)
            }
            "search_similar" => {
                let request: SearchSimilarRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.search_similar(request).await?,
                )?)
            }
            "get_memory" => {
                let hash = required_str(&arguments, "content_hash")?;
                Ok(serde_json::to_value(self.service.get_memory(&hash).await?)?)
            }
            "delete_memory" => {
                let hash = required_str(&arguments, "content_hash")?;
                Ok(serde_json::to_value(
                    self.service.delete_memory(&hash).await?,
                )?)
            }
            "delete_by_tag" => {
                let request: DeleteByTagRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.delete_by_tag(request).await?,
                )?)
            }
            "delete_by_time_range" => {
                let request: DeleteByTimeRangeRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.delete_by_time_range(request).await?,
                )?)
            }
            "update_memory_metadata" => {
                let request: UpdateMemoryMetadataRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.update_memory_metadata(request).await?,
                )?)
            }
            "list_memories" => {
                let request: ListMemoriesRequest = parse_args(arguments)?;
                Ok(serde_json::to_value(
                    self.service.list_memories(request).await?,
                )?)
            }
            "list_tags" => Ok(serde_json::to_value(self.service.list_tags().await?)?),
            "check_database_health" => Ok(serde_json::to_value(
                self.service.check_database_health().await?,
            )?),
            other => Err(MnemoError::InvalidInput(format!("unknown tool: {other}"))),
        }
    }
}

#[async_trait]
impl McpHandler for MemoryToolHandler {
    async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        match request.method.as_str() {
            methods::INITIALIZE => Some(McpResponse::success(
                request.id,
                serde_json::to_value(InitializeResult::default()).ok()?,
            )),
            methods::INITIALIZED => None,
            methods::LIST_TOOLS => Some(McpResponse::success(
                request.id,
                json!({ "tools": get_tool_definitions() }),
            )),
            methods::CALL_TOOL => {
                let name = request.params.get("name").and_then(Value::as_str);
                let arguments = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                let Some(name) = name else {
                    return Some(McpResponse::error(
                        request.id,
                        -32602,
                        "tools/call requires a tool name".into(),
                    ));
                };

                let result = match self.call_tool(name, arguments).await {
                    Ok(value) => ToolCallResult::json(&value),
                    Err(e) => {
                        tracing::debug!(tool = name, error = %e, "tool call failed");
                        ToolCallResult::error(format!("{}: {e}", e.kind()))
                    }
                };
                Some(McpResponse::success(
                    request.id,
                    serde_json::to_value(result).ok()?,
                ))
            }
            _ if request.is_notification() => None,
            other => Some(McpResponse::error(
                request.id,
                -32601,
                format!("Method not found: {other}"),
            )),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| MnemoError::InvalidInput(format!("invalid tool arguments: {e}")))
}

fn required_str(arguments: &Value, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| MnemoError::InvalidInput(format!("missing required argument '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{EmbeddingHandle, HashedEmbedder};
    use crate::storage::SqliteVecStorage;

    fn handler() -> MemoryToolHandler {
        let provider = Arc::new(HashedEmbedder::new(64));
        let handle = EmbeddingHandle::new(provider, &EmbeddingConfig::default());
        let storage = Arc::new(SqliteVecStorage::open_in_memory(handle).unwrap());
        MemoryToolHandler::new(Arc::new(MemoryService::new(storage, false)))
    }

    fn request(method: &str, params: Value) -> McpRequest {
        McpRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(1)),
            method: method.into(),
            params,
        }
    }

    #[test]
    fn definitions_parse() {
        let definitions = get_tool_definitions();
        assert_eq!(definitions.len(), TOOL_DEFINITIONS.len());
        assert!(definitions.iter().any(|d| d.name == "store_memory"));
        assert!(definitions.iter().any(|d| d.name == "check_database_health"));
    }

    #[tokio::test]
    async fn initialize_responds() {
        let handler = handler();
        let response = handler
            .handle_request(request(methods::INITIALIZE, json!({})))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "mnemo");
    }

    #[tokio::test]
    async fn initialized_notification_is_silent() {
        let handler = handler();
        let mut notification = request(methods::INITIALIZED, json!({}));
        notification.id = None;
        assert!(handler.handle_request(notification).await.is_none());
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let handler = handler();
        handler.service.initialize().await.unwrap();

        let response = handler
            .handle_request(request(
                methods::CALL_TOOL,
                json!({
                    "name": "store_memory",
                    "arguments": {"content": "stdio stored this", "tags": ["rpc"]}
                }),
            ))
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert!(result.get("isError").is_none());
        let text = result["content"][0]["text"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["stored"], true);
    }

    #[tokio::test]
    async fn unknown_tool_is_flagged_error() {
        let handler = handler();
        let response = handler
            .handle_request(request(
                methods::CALL_TOOL,
                json!({"name": "no_such_tool", "arguments": {}}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("invalid_input"));
    }

    #[tokio::test]
    async fn unknown_method_is_rpc_error() {
        let handler = handler();
        let response = handler
            .handle_request(request("bogus/method", json!({})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }
}
