//! `relgate relationships`: dump stored relationships through the graph client.

use anyhow::{Context, Result};
use relgate_config::RelgateConfig;
use relgate_core::RelationshipFilter;
use relgate_graph::PermissionChecker;

use crate::terminal_output::note_success;

pub async fn run(config: &RelgateConfig, limit: usize, resource_type: Option<String>) -> Result<()> {
    let graph = relgate_graph::connect(&config.graph)?;
    let checker = PermissionChecker::from_config(graph, &config.graph);
    let filter = RelationshipFilter { resource_type, ..Default::default() };
    let tuples = checker
        .read(&filter, Some(limit))
        .await
        .context("Failed to read relationships")?;
    for tuple in &tuples {
        println!("{tuple}");
    }
    note_success(&format!("{} relationship(s) from {} (limit {limit})", tuples.len(), checker.graph().name()));
    Ok(())
}
