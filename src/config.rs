//! Service configuration
//!
//! The server binary parses flags/environment into these structs; the
//! library only ever sees the assembled [`ServiceConfig`].

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MnemoError, Result};

/// Which storage backend the engine runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single-file SQLite with a vector index, owned by this process
    Embedded,
    /// External vector index + relational store + optional object store
    Cloud,
    /// Thin client that calls a coordinator's HTTP API
    Federated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Cloud => "cloud",
            Self::Federated => "federated",
        }
    }
}

impl FromStr for BackendKind {
    type Err = MnemoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "embedded" => Ok(Self::Embedded),
            "cloud" => Ok(Self::Cloud),
            "federated" => Ok(Self::Federated),
            other => Err(MnemoError::Config(format!(
                "unknown storage backend '{other}' (expected embedded, cloud, or federated)"
            ))),
        }
    }
}

/// Embedded backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Database file path (`:memory:` for tests)
    pub path: String,
    /// Comma-separated `key=value` pragma overrides layered on the defaults
    pub pragma_overrides: Option<String>,
    /// Lock wait in milliseconds; raised when running in contended direct mode
    pub busy_timeout_ms: u64,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pragma_overrides: None,
            busy_timeout_ms: 5000,
        }
    }
}

/// Cloud backend settings (vector index + relational store + object store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// API base, e.g. "https://api.cloudflare.com/client/v4"
    pub api_base: String,
    pub account: String,
    pub token: String,
    /// Vector index name
    pub vector_index: String,
    /// Relational database identifier
    pub relational_db: String,
    /// Optional object-store bucket for large content
    pub object_bucket: Option<String>,
    /// Content above this many bytes is offloaded to the object store
    pub large_content_threshold: usize,
    pub max_retries: u32,
    pub base_delay_s: f64,
}

impl CloudConfig {
    pub fn validate(&self) -> Result<()> {
        if self.account.is_empty() || self.token.is_empty() {
            return Err(MnemoError::Config(
                "cloud backend requires account and token".into(),
            ));
        }
        if self.vector_index.is_empty() || self.relational_db.is_empty() {
            return Err(MnemoError::Config(
                "cloud backend requires vector_index and relational_db".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.cloudflare.com/client/v4".into(),
            account: String::new(),
            token: String::new(),
            vector_index: String::new(),
            relational_db: String::new(),
            object_bucket: None,
            large_content_threshold: crate::types::MAX_INLINE_CONTENT_BYTES,
            max_retries: 3,
            base_delay_s: 1.0,
        }
    }
}

/// Federated backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FederatedConfig {
    /// Coordinator base URL, e.g. "http://127.0.0.1:8443"
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// HTTP coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,
    /// SSE heartbeat interval in seconds
    pub sse_heartbeat_s: u64,
    /// Optional bearer token required on every request when set
    pub api_key: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 8443,
            cors_origins: vec!["*".into()],
            sse_heartbeat_s: 30,
            api_key: None,
        }
    }
}

/// Embedding provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider: "hashed" (in-process), "remote", or "onnx" (feature-gated)
    pub provider: String,
    /// Vector dimension for providers with a configurable width
    pub dimension: usize,
    /// LRU cache capacity in entries
    pub cache_size: usize,
    /// Max embedding calls in flight before queuing
    pub max_in_flight: usize,
    /// Queue depth beyond which callers fail with ResourceExhausted
    pub max_waiting: usize,
    /// Remote provider: OpenAI-compatible embeddings endpoint base
    pub remote_base_url: String,
    pub remote_api_key: Option<String>,
    pub remote_model: String,
    /// Local ONNX provider: directory holding model.onnx + tokenizer.json
    pub model_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashed".into(),
            dimension: 384,
            cache_size: 1024,
            max_in_flight: 4,
            max_waiting: 64,
            remote_base_url: "https://api.openai.com/v1".into(),
            remote_api_key: None,
            remote_model: "text-embedding-3-small".into(),
            model_dir: None,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub backend: BackendKind,
    pub embedded: EmbeddedConfig,
    pub cloud: CloudConfig,
    pub federated: FederatedConfig,
    pub http: HttpConfig,
    pub embedding: EmbeddingConfig,
    /// When enabled, records carry a `source:<hostname>` tag and
    /// `hostname` metadata
    pub hostname_tagging: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Embedded,
            embedded: EmbeddedConfig::default(),
            cloud: CloudConfig::default(),
            federated: FederatedConfig::default(),
            http: HttpConfig::default(),
            embedding: EmbeddingConfig::default(),
            hostname_tagging: false,
        }
    }
}

/// Default database location: `~/.local/share/mnemo/memories.db`
pub fn default_db_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mnemo")
        .join("memories.db")
        .to_string_lossy()
        .into_owned()
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
