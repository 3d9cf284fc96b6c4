//! The active rule table.
//!
//! Readers take an `Arc` snapshot and keep it for the whole request; a reload
//! compiles a complete new table and swaps the pointer. A table is never
//! edited in place.

use std::sync::Arc;

use anyhow::{Context, Result};
use relgate_config::{load_rules_file, RuleSpec, RulesConfig};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::compile::{RuleLoadError, RuleTable};

/// Shared handle to the active [`RuleTable`].
#[derive(Clone)]
pub struct RuleStore {
    active: Arc<RwLock<Arc<RuleTable>>>,
    declared: Arc<Vec<String>>,
}

impl RuleStore {
    pub fn new(table: RuleTable, declared: Vec<String>) -> Self {
        Self {
            active: Arc::new(RwLock::new(Arc::new(table))),
            declared: Arc::new(declared),
        }
    }

    /// Compile `specs` into the initial table.
    pub fn compile(specs: &[RuleSpec], declared: Vec<String>) -> Result<Self, RuleLoadError> {
        let table = RuleTable::compile(specs, &declared)?;
        info!(rules = table.len(), kinds = table.kinds().len(), "Rule table compiled");
        Ok(Self::new(table, declared))
    }

    /// The table in effect right now.
    pub async fn snapshot(&self) -> Arc<RuleTable> {
        self.active.read().await.clone()
    }

    /// Replace the active table, returning the previous one.
    pub async fn swap(&self, table: RuleTable) -> Arc<RuleTable> {
        let mut active = self.active.write().await;
        std::mem::replace(&mut *active, Arc::new(table))
    }

    /// Compile `specs` and swap them in. On failure the current table stays
    /// active.
    pub async fn reload(&self, specs: &[RuleSpec]) -> Result<usize, RuleLoadError> {
        match RuleTable::compile(specs, &self.declared) {
            Ok(table) => {
                let count = table.len();
                let previous = self.swap(table).await;
                info!(previous = previous.len(), rules = count, "Rule table swapped");
                Ok(count)
            }
            Err(e) => {
                error!(error = %e, "Rule reload rejected; keeping current rules");
                Err(e)
            }
        }
    }

    pub fn declared_fields(&self) -> &[String] {
        &self.declared
    }
}

/// Inline rules followed by the rules file, if one is configured.
pub async fn collect_rule_specs(config: &RulesConfig) -> Result<Vec<RuleSpec>> {
    let mut specs = config.inline.clone();
    if let Some(path) = &config.path {
        let from_file = load_rules_file(path)
            .await
            .with_context(|| format!("Failed to load rules from {}", path.display()))?;
        specs.extend(from_file);
    }
    Ok(specs)
}
