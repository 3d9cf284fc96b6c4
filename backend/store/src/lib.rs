//! `relgate-store` — clients for the backend resource store.
//!
//! [`KubeClient`] speaks a Kubernetes-style REST API; [`MemoryStore`] keeps
//! objects in process for embedded use and tests.

pub mod http;
pub mod memory;

pub use http::{resource_path, KubeClient};
pub use memory::{MemoryStore, Operation};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relgate_config::{BackendConfig, BackendKind};
use relgate_core::ResourceBackend;
use tracing::info;

/// Build the configured backend client.
pub fn connect(cfg: &BackendConfig) -> Result<Arc<dyn ResourceBackend>> {
    let backend: Arc<dyn ResourceBackend> = match cfg.kind {
        BackendKind::Http => {
            let endpoint = cfg.endpoint.clone().context("backend.endpoint is required for http")?;
            info!(endpoint = %endpoint, "Using HTTP resource backend");
            Arc::new(KubeClient::new(
                endpoint,
                cfg.token.clone(),
                Duration::from_millis(cfg.timeout_ms),
            ))
        }
        BackendKind::Memory => {
            let store = MemoryStore::from_config(&cfg.objects).context("Failed to seed memory store")?;
            info!(kinds = cfg.objects.len(), "Using in-memory resource backend");
            Arc::new(store)
        }
    };
    Ok(backend)
}
