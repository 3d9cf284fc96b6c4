//! Periodic relationship dump for operators.

use std::time::Duration;

use relgate_core::{RelationshipFilter, RelationshipTuple};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checker::PermissionChecker;

/// Read up to `limit` relationships and log each one plus a total.
pub async fn log_snapshot(checker: &PermissionChecker, limit: usize) -> Option<Vec<RelationshipTuple>> {
    match checker.read(&RelationshipFilter::default(), Some(limit)).await {
        Ok(tuples) => {
            for tuple in &tuples {
                info!(relationship = %tuple, "Relationship");
            }
            info!(total = tuples.len(), limit, graph = checker.graph().name(), "Relationship snapshot");
            Some(tuples)
        }
        Err(e) => {
            warn!(error = %e, "Relationship snapshot failed");
            None
        }
    }
}

/// Log a snapshot every `interval` until `shutdown` flips to true.
pub fn spawn_snapshot_printer(
    checker: PermissionChecker,
    interval: Duration,
    limit: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    log_snapshot(&checker, limit).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Relationship snapshot printer stopped");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;

    #[tokio::test]
    async fn snapshot_respects_limit() {
        let graph = Arc::new(MemoryGraph::default());
        for id in ["a", "b", "c"] {
            graph.insert(format!("namespace:{id}#viewer@user:bob").parse().unwrap()).await;
        }
        let checker = PermissionChecker::new(graph, Duration::from_secs(1), RetryPolicy::none());
        assert_eq!(log_snapshot(&checker, 2).await.map(|t| t.len()), Some(2));
    }

    #[tokio::test]
    async fn printer_stops_on_shutdown() {
        let checker = PermissionChecker::new(
            Arc::new(MemoryGraph::default()),
            Duration::from_secs(1),
            RetryPolicy::none(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = spawn_snapshot_printer(checker, Duration::from_millis(5), 10, rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
