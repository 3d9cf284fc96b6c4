//! `relgate-graph` — permission graph access.
//!
//! [`PermissionChecker`] wraps any [`relgate_core::PermissionGraph`] with
//! timeouts and read retries. Two graphs ship: [`SpiceDbClient`] for a remote
//! SpiceDB and [`MemoryGraph`] for embedded use and tests.

pub mod checker;
pub mod memory;
pub mod retry;
pub mod snapshot;
pub mod spicedb;

pub use checker::PermissionChecker;
pub use memory::{bootstrap_schema, MemoryGraph, Schema};
pub use retry::RetryPolicy;
pub use snapshot::{log_snapshot, spawn_snapshot_printer};
pub use spicedb::SpiceDbClient;

use std::sync::Arc;

use anyhow::{Context, Result};
use relgate_config::{GraphConfig, GraphKind};
use relgate_core::PermissionGraph;
use tracing::info;

/// Build the configured graph client.
pub fn connect(cfg: &GraphConfig) -> Result<Arc<dyn PermissionGraph>> {
    let graph: Arc<dyn PermissionGraph> = match cfg.kind {
        GraphKind::Spicedb => {
            let endpoint = cfg.endpoint.clone().context("graph.endpoint is required for spicedb")?;
            info!(endpoint = %endpoint, "Using SpiceDB permission graph");
            Arc::new(SpiceDbClient::new(endpoint, cfg.token.clone()))
        }
        GraphKind::Embedded => Arc::new(
            MemoryGraph::from_config(&cfg.schema, &cfg.relationships)
                .context("Failed to bootstrap embedded graph")?,
        ),
    };
    Ok(graph)
}
