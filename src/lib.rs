//! mnemo — persistent semantic memory for AI assistants
//!
//! Content-addressed text memories with tags and metadata, embedded into
//! vectors and served over two transports (JSON-RPC on stdio and an
//! HTTP/SSE API). Storage is pluggable: an embedded SQLite file with a
//! vector index, a cloud vector+relational pair, or a thin client that
//! federates to a coordinator process.

pub mod config;
pub mod embedding;
pub mod error;
pub mod identity;
pub mod mcp;
pub mod query;
pub mod server;
pub mod service;
pub mod storage;
pub mod types;

pub use error::{MnemoError, Result};
pub use service::MemoryService;
pub use storage::MemoryStorage;
pub use types::{Memory, MemoryQueryResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
