//! Server wiring: coordinator mode selection and process startup
//!
//! At startup the process picks exactly one mode and keeps it for its
//! lifetime:
//!
//! - **direct** — open the embedded database in this process; WAL handles
//!   concurrent readers
//! - **http_server** — own the embedded database *and* run the HTTP
//!   coordinator for other local processes
//! - **http_client** — a coordinator is already running; satisfy storage
//!   through its API instead of opening the file

pub mod events;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::{BackendKind, ServiceConfig};
use crate::embedding::{self, EmbeddingHandle};
use crate::error::{MnemoError, Result};
use crate::mcp::{McpServer, MemoryToolHandler};
use crate::service::MemoryService;
use crate::storage::{CloudStorage, FederatedStorage, MemoryStorage, SqliteVecStorage};
use self::events::EventBroadcaster;
use self::http::AppState;

/// Multiplier applied to the embedded busy timeout when another process
/// already owns the coordinator port (contended direct mode)
const CONTENDED_BUSY_TIMEOUT_FACTOR: u64 = 6;

/// How long the liveness probe waits for an existing coordinator
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The mode this process runs in, fixed at startup
pub enum ServerMode {
    /// Open the embedded backend directly
    Direct { contended: bool },
    /// Own the database and serve the coordinator API on this listener
    HttpServer(TcpListener),
    /// Federate to an existing coordinator
    HttpClient,
}

impl ServerMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::HttpServer(_) => "http_server",
            Self::HttpClient => "http_client",
        }
    }
}

/// Probe a coordinator's liveness endpoint.
async fn coordinator_alive(endpoint: &str) -> bool {
    let url = format!("{}/api/health", endpoint.trim_end_matches('/'));
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Pick the process mode for the embedded backend.
///
/// 1. A reachable coordinator wins: federate to it.
/// 2. Otherwise try to bind the coordinator port; success means this
///    process is the writer (and coordinator, when HTTP is enabled).
/// 3. A failed bind means another process holds the port but is not
///    serving yet; fall back to direct with the busy timeout raised.
pub async fn select_mode(config: &ServiceConfig) -> ServerMode {
    if !config.federated.endpoint.is_empty() && coordinator_alive(&config.federated.endpoint).await
    {
        tracing::info!(endpoint = %config.federated.endpoint, "coordinator detected; federating");
        return ServerMode::HttpClient;
    }

    let bind_addr = format!("{}:{}", config.http.host, config.http.port);
    match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            if config.http.enabled {
                ServerMode::HttpServer(listener)
            } else {
                // Listener dropped; nothing else owns the file yet
                ServerMode::Direct { contended: false }
            }
        }
        Err(e) => {
            tracing::warn!(addr = %bind_addr, error = %e,
                "coordinator port taken; running direct with raised busy timeout");
            ServerMode::Direct { contended: true }
        }
    }
}

/// Build the storage backend for the selected mode.
fn build_storage(
    config: &ServiceConfig,
    mode: &ServerMode,
    embedder: &EmbeddingHandle,
) -> Result<Arc<dyn MemoryStorage>> {
    match config.backend {
        BackendKind::Federated => Ok(Arc::new(FederatedStorage::new(config.federated.clone())?)),
        BackendKind::Cloud => Ok(Arc::new(CloudStorage::new(
            config.cloud.clone(),
            embedder.clone(),
        )?)),
        BackendKind::Embedded => match mode {
            ServerMode::HttpClient => {
                Ok(Arc::new(FederatedStorage::new(config.federated.clone())?))
            }
            ServerMode::Direct { contended } => {
                let mut embedded = config.embedded.clone();
                if *contended {
                    embedded.busy_timeout_ms *= CONTENDED_BUSY_TIMEOUT_FACTOR;
                }
                Ok(Arc::new(SqliteVecStorage::open(&embedded, embedder.clone())?))
            }
            ServerMode::HttpServer(_) => Ok(Arc::new(SqliteVecStorage::open(
                &config.embedded,
                embedder.clone(),
            )?)),
        },
    }
}

/// Start the service with the configured transports and run until EOF on
/// stdin (stdio transport) or the HTTP server stops.
pub async fn run(config: ServiceConfig, stdio: bool) -> Result<()> {
    let provider = embedding::create_provider(&config.embedding)?;
    let embedder = EmbeddingHandle::new(provider, &config.embedding);

    let mode = match config.backend {
        BackendKind::Embedded => select_mode(&config).await,
        BackendKind::Federated => ServerMode::HttpClient,
        BackendKind::Cloud if config.http.enabled => {
            let bind_addr = format!("{}:{}", config.http.host, config.http.port);
            ServerMode::HttpServer(TcpListener::bind(&bind_addr).await?)
        }
        BackendKind::Cloud => ServerMode::Direct { contended: false },
    };
    tracing::info!(mode = mode.name(), backend = config.backend.as_str(), "mode selected");

    let events = EventBroadcaster::new();
    let storage = build_storage(&config, &mode, &embedder)?;
    let service = Arc::new(
        MemoryService::new(storage, config.hostname_tagging).with_events(events.clone()),
    );

    // A dimension mismatch leaves the engine serving tag/time/hash reads;
    // health reports the degradation.
    match service.initialize().await {
        Ok(()) => tracing::info!("storage initialized"),
        Err(e @ MnemoError::DimensionMismatch { .. }) => {
            tracing::error!(error = %e, "running degraded: semantic operations disabled");
        }
        Err(e) => return Err(e),
    }

    let http_task = match mode {
        ServerMode::HttpServer(listener) => {
            let state = AppState {
                service: service.clone(),
                events,
                api_key: config.http.api_key.clone(),
                heartbeat: Duration::from_secs(config.http.sse_heartbeat_s.max(1)),
                cors_origin: config
                    .http
                    .cors_origins
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "*".into()),
            };
            Some(tokio::spawn(http::serve(listener, state)))
        }
        _ => None,
    };

    match (stdio, http_task) {
        (true, Some(http_task)) => {
            let rpc = McpServer::new(MemoryToolHandler::new(service));
            tokio::select! {
                result = rpc.run() => result,
                result = http_task => result
                    .map_err(|e| MnemoError::internal(format!("http server task: {e}")))?,
            }
        }
        (true, None) => {
            let rpc = McpServer::new(MemoryToolHandler::new(service));
            rpc.run().await
        }
        (false, Some(http_task)) => http_task
            .await
            .map_err(|e| MnemoError::internal(format!("http server task: {e}")))?,
        (false, None) => Err(MnemoError::Config(
            "no transport enabled: pass --http-enabled or keep stdio on".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_fails_fast_on_dead_endpoint() {
        assert!(!coordinator_alive("http://127.0.0.1:9").await);
    }

    #[tokio::test]
    async fn select_mode_binds_when_no_coordinator() {
        let config = ServiceConfig {
            http: crate::config::HttpConfig {
                enabled: true,
                host: "127.0.0.1".into(),
                port: 0, // ephemeral
                ..Default::default()
            },
            ..Default::default()
        };
        let mode = select_mode(&config).await;
        assert_eq!(mode.name(), "http_server");
    }

    #[tokio::test]
    async fn select_mode_direct_when_http_disabled() {
        let config = ServiceConfig {
            http: crate::config::HttpConfig {
                enabled: false,
                host: "127.0.0.1".into(),
                port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mode = select_mode(&config).await;
        assert_eq!(mode.name(), "direct");
    }
}
