//! mnemo server
//!
//! Run with: mnemo-server

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mnemo::config::{
    expand_tilde, BackendKind, CloudConfig, EmbeddedConfig, EmbeddingConfig, FederatedConfig,
    HttpConfig, ServiceConfig,
};
use mnemo::error::Result;
use mnemo::server;

#[derive(Parser, Debug)]
#[command(name = "mnemo-server")]
#[command(about = "Persistent semantic memory service for AI assistants")]
#[command(version)]
struct Args {
    /// Storage backend: embedded, cloud, or federated
    #[arg(long, env = "MNEMO_STORAGE_BACKEND", default_value = "embedded")]
    storage_backend: String,

    /// Embedded database path
    #[arg(long, env = "MNEMO_DB_PATH")]
    db_path: Option<String>,

    /// Comma-separated pragma overrides for the embedded backend
    /// (e.g. "cache_size=-128000,mmap_size=268435456")
    #[arg(long, env = "MNEMO_SQLITE_PRAGMAS")]
    sqlite_pragmas: Option<String>,

    /// Cloud API base URL
    #[arg(
        long,
        env = "MNEMO_CLOUD_API_BASE",
        default_value = "https://api.cloudflare.com/client/v4"
    )]
    cloud_api_base: String,

    /// Cloud account identifier
    #[arg(long, env = "MNEMO_CLOUD_ACCOUNT", default_value = "")]
    cloud_account: String,

    /// Cloud API token
    #[arg(long, env = "MNEMO_CLOUD_TOKEN", default_value = "")]
    cloud_token: String,

    /// Cloud vector index name
    #[arg(long, env = "MNEMO_CLOUD_VECTOR_INDEX", default_value = "")]
    cloud_vector_index: String,

    /// Cloud relational database identifier
    #[arg(long, env = "MNEMO_CLOUD_RELATIONAL_DB", default_value = "")]
    cloud_relational_db: String,

    /// Cloud object bucket for large content (optional)
    #[arg(long, env = "MNEMO_CLOUD_OBJECT_BUCKET")]
    cloud_object_bucket: Option<String>,

    /// Bytes above which content is offloaded to the object store
    #[arg(
        long,
        env = "MNEMO_CLOUD_LARGE_CONTENT_THRESHOLD",
        default_value = "1048576"
    )]
    cloud_large_content_threshold: usize,

    /// Max retries for transient cloud failures
    #[arg(long, env = "MNEMO_CLOUD_MAX_RETRIES", default_value = "3")]
    cloud_max_retries: u32,

    /// Base backoff delay in seconds for cloud retries
    #[arg(long, env = "MNEMO_CLOUD_BASE_DELAY", default_value = "1.0")]
    cloud_base_delay: f64,

    /// Coordinator endpoint for federation (probed at startup)
    #[arg(long, env = "MNEMO_COORDINATOR_ENDPOINT", default_value = "")]
    coordinator_endpoint: String,

    /// Bearer token for the HTTP surface (served and sent)
    #[arg(long, env = "MNEMO_API_KEY")]
    api_key: Option<String>,

    /// Enable the HTTP coordinator surface
    #[arg(long, env = "MNEMO_HTTP_ENABLED")]
    http_enabled: bool,

    #[arg(long, env = "MNEMO_HTTP_HOST", default_value = "127.0.0.1")]
    http_host: String,

    #[arg(long, env = "MNEMO_HTTP_PORT", default_value = "8443")]
    http_port: u16,

    /// Comma-separated allowed CORS origins
    #[arg(long, env = "MNEMO_CORS_ORIGINS", default_value = "*")]
    cors_origins: String,

    /// SSE heartbeat interval in seconds
    #[arg(long, env = "MNEMO_SSE_HEARTBEAT", default_value = "30")]
    sse_heartbeat: u64,

    /// Embedding provider: hashed, remote, or onnx
    #[arg(long, env = "MNEMO_EMBEDDING_PROVIDER", default_value = "hashed")]
    embedding_provider: String,

    /// Embedding dimension for width-configurable providers
    #[arg(long, env = "MNEMO_EMBEDDING_DIMENSION", default_value = "384")]
    embedding_dimension: usize,

    /// Embedding cache capacity in entries
    #[arg(long, env = "MNEMO_EMBEDDING_CACHE_SIZE", default_value = "1024")]
    embedding_cache_size: usize,

    /// Directory holding model.onnx and tokenizer.json (onnx provider)
    #[arg(long, env = "MNEMO_EMBEDDING_MODEL_DIR")]
    embedding_model_dir: Option<String>,

    /// Remote embedding endpoint base (OpenAI-compatible)
    #[arg(
        long,
        env = "MNEMO_REMOTE_EMBEDDING_URL",
        default_value = "https://api.openai.com/v1"
    )]
    remote_embedding_url: String,

    /// Remote embedding API key
    #[arg(long, env = "MNEMO_REMOTE_EMBEDDING_KEY")]
    remote_embedding_key: Option<String>,

    /// Remote embedding model name
    #[arg(
        long,
        env = "MNEMO_REMOTE_EMBEDDING_MODEL",
        default_value = "text-embedding-3-small"
    )]
    remote_embedding_model: String,

    /// Tag stored memories with the source hostname
    #[arg(long, env = "MNEMO_HOSTNAME_TAGGING")]
    hostname_tagging: bool,

    /// Disable the stdio RPC transport (HTTP only)
    #[arg(long)]
    no_stdio: bool,
}

impl Args {
    fn into_config(self) -> Result<(ServiceConfig, bool)> {
        let backend: BackendKind = self.storage_backend.parse()?;

        let embedded = {
            let mut embedded = EmbeddedConfig::default();
            if let Some(path) = &self.db_path {
                embedded.path = expand_tilde(path).to_string_lossy().into_owned();
            }
            embedded.pragma_overrides = self.sqlite_pragmas.clone();
            embedded
        };

        let config = ServiceConfig {
            backend,
            embedded,
            cloud: CloudConfig {
                api_base: self.cloud_api_base,
                account: self.cloud_account,
                token: self.cloud_token,
                vector_index: self.cloud_vector_index,
                relational_db: self.cloud_relational_db,
                object_bucket: self.cloud_object_bucket,
                large_content_threshold: self.cloud_large_content_threshold,
                max_retries: self.cloud_max_retries,
                base_delay_s: self.cloud_base_delay,
            },
            federated: FederatedConfig {
                endpoint: self.coordinator_endpoint,
                api_key: self.api_key.clone(),
            },
            http: HttpConfig {
                enabled: self.http_enabled,
                host: self.http_host,
                port: self.http_port,
                cors_origins: self
                    .cors_origins
                    .split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect(),
                sse_heartbeat_s: self.sse_heartbeat,
                api_key: self.api_key,
            },
            embedding: EmbeddingConfig {
                provider: self.embedding_provider,
                dimension: self.embedding_dimension,
                cache_size: self.embedding_cache_size,
                remote_base_url: self.remote_embedding_url,
                remote_api_key: self.remote_embedding_key,
                remote_model: self.remote_embedding_model,
                model_dir: self.embedding_model_dir.map(|dir| expand_tilde(&dir)),
                ..EmbeddingConfig::default()
            },
            hostname_tagging: self.hostname_tagging,
        };

        Ok((config, !self.no_stdio))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the stdio RPC transport
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, stdio) = Args::parse().into_config()?;
    tracing::info!(
        version = mnemo::VERSION,
        backend = config.backend.as_str(),
        "starting mnemo"
    );

    server::run(config, stdio).await
}
