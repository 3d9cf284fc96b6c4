//! Rule hot-reload.
//!
//! Watches the rules file and recompiles the whole table on change. A table
//! that fails to compile is rejected and the current one stays active.

use std::path::Path;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use relgate_config::RulesConfig;
use relgate_rules::{collect_rule_specs, RuleStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct RuleReloader {
    store: RuleStore,
    config: RulesConfig,
}

impl RuleReloader {
    pub fn new(store: RuleStore, config: RulesConfig) -> Self {
        Self { store, config }
    }

    /// Re-read inline and file rules and swap them in. Returns the new rule count.
    pub async fn reload(&self) -> Result<usize> {
        let specs = collect_rule_specs(&self.config).await?;
        let count = self.store.reload(&specs).await?;
        Ok(count)
    }

    /// Watch the rules file until `shutdown` flips. Does nothing when no rules
    /// file is configured.
    pub fn watch(&self, mut shutdown: watch::Receiver<bool>) -> Result<Option<JoinHandle<()>>> {
        let Some(path) = self.config.path.clone() else {
            return Ok(None);
        };
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Err(e) = tx.blocking_send(res) {
                error!(error = %e, "Failed to forward rules file event");
            }
        })?;
        // editors often replace the file, so watch the directory and filter
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        info!(path = %path.display(), "Watching rules file for changes");

        let reloader = self.clone();
        let file_name = path.file_name().map(|n| n.to_os_string());
        Ok(Some(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            Ok(event) => {
                                let ours = event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                                if !ours || !(event.kind.is_modify() || event.kind.is_create()) {
                                    continue;
                                }
                                info!("Rules file changed; reloading");
                                if let Err(e) = reloader.reload().await {
                                    error!(error = %e, "Rule reload failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "Rules watch error"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Rules watcher stopped");
        })))
    }
}
