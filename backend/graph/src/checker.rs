//! Permission Checker: the proxy's only path to the permission graph.
//!
//! Every call is bounded by a timeout; a timeout is reported as
//! [`GraphError::Unavailable`]. Reads (check, lookup, read) are retried with
//! backoff, writes are attempted exactly once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relgate_config::GraphConfig;
use relgate_core::{
    GraphError, Permissionship, PermissionGraph, Precondition, RelationshipFilter,
    RelationshipTuple, RelationshipWrite, SubjectRef, WriteOutcome,
};
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct PermissionChecker {
    graph: Arc<dyn PermissionGraph>,
    timeout: Duration,
    retry: RetryPolicy,
    lookup_limit: usize,
}

impl PermissionChecker {
    pub fn new(graph: Arc<dyn PermissionGraph>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { graph, timeout, retry, lookup_limit: usize::MAX }
    }

    pub fn from_config(graph: Arc<dyn PermissionGraph>, cfg: &GraphConfig) -> Self {
        Self {
            graph,
            timeout: Duration::from_millis(cfg.timeout_ms),
            retry: RetryPolicy::from(&cfg.read_retry),
            lookup_limit: cfg.lookup_limit,
        }
    }

    pub fn with_lookup_limit(mut self, limit: usize) -> Self {
        self.lookup_limit = limit;
        self
    }

    pub fn graph(&self) -> &Arc<dyn PermissionGraph> {
        &self.graph
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, GraphError>>,
    ) -> Result<T, GraphError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, graph = self.graph.name(), timeout_ms = self.timeout.as_millis() as u64, "Graph call timed out");
                Err(GraphError::Unavailable(format!("{op} timed out after {:?}", self.timeout)))
            }
        }
    }

    /// ALLOWED or DENIED; a missing tuple is simply DENIED.
    pub async fn check(&self, tuple: &RelationshipTuple) -> Result<Permissionship, GraphError> {
        let result = self
            .retry
            .run("check", || self.bounded("check", self.graph.check(tuple)))
            .await?;
        debug!(tuple = %tuple, allowed = result.is_allowed(), "Checked");
        Ok(result)
    }

    /// True if any of `tuples` is allowed. Tuples are checked in order and the
    /// first allowed one ends the walk. An empty slice is never allowed.
    pub async fn check_any(&self, tuples: &[RelationshipTuple]) -> Result<bool, GraphError> {
        for tuple in tuples {
            if self.check(tuple).await?.is_allowed() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resource ids of `resource_type` on which `subject` holds `permission`,
    /// capped at the configured lookup limit.
    pub async fn lookup(
        &self,
        resource_type: &str,
        permission: &str,
        subject: &SubjectRef,
    ) -> Result<Vec<String>, GraphError> {
        let limit = Some(self.lookup_limit).filter(|l| *l != usize::MAX);
        let ids = self
            .retry
            .run("lookup", || {
                self.bounded(
                    "lookup",
                    self.graph.lookup_resources(resource_type, permission, subject, limit),
                )
            })
            .await?;
        debug!(resource_type, permission, subject = %subject.subject_id, found = ids.len(), "Looked up");
        Ok(ids)
    }

    pub async fn read(
        &self,
        filter: &RelationshipFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RelationshipTuple>, GraphError> {
        self.retry
            .run("read", || self.bounded("read", self.graph.read_relationships(filter, limit)))
            .await
    }

    /// First precondition that does not hold right now, if any. Read-only:
    /// nothing is written.
    pub async fn first_failed_precondition(
        &self,
        preconditions: &[Precondition],
    ) -> Result<Option<Precondition>, GraphError> {
        for precondition in preconditions {
            let exists = !self.read(&precondition.filter, Some(1)).await?.is_empty();
            if !precondition.holds(exists) {
                debug!(precondition = %precondition, "Precondition does not hold");
                return Ok(Some(precondition.clone()));
            }
        }
        Ok(None)
    }

    /// One atomic write, never retried.
    pub async fn write(&self, write: &RelationshipWrite) -> Result<WriteOutcome, GraphError> {
        let outcome = self.bounded("write", self.graph.write_relationships(write)).await?;
        debug!(
            creates = write.creates.len(),
            deletes = write.deletes.len(),
            preconditions = write.preconditions.len(),
            outcome = ?outcome,
            "Wrote relationships"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t(raw: &str) -> RelationshipTuple {
        raw.parse().unwrap()
    }

    fn fast() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay_ms: 1, backoff_factor: 1.0, max_delay_ms: 1, jitter: false }
    }

    /// Sleeps through every call and counts them.
    struct Stalled {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PermissionGraph for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn check(&self, _: &RelationshipTuple) -> Result<Permissionship, GraphError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Permissionship::Allowed)
        }
        async fn lookup_resources(
            &self,
            _: &str,
            _: &str,
            _: &SubjectRef,
            _: Option<usize>,
        ) -> Result<Vec<String>, GraphError> {
            Ok(vec![])
        }
        async fn write_relationships(&self, _: &RelationshipWrite) -> Result<WriteOutcome, GraphError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(WriteOutcome::Committed { revision: "0".into() })
        }
        async fn read_relationships(
            &self,
            _: &RelationshipFilter,
            _: Option<usize>,
        ) -> Result<Vec<RelationshipTuple>, GraphError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn timeouts_fail_closed_and_reads_retry() {
        let graph = Arc::new(Stalled { calls: AtomicU32::new(0) });
        let checker = PermissionChecker::new(graph.clone(), Duration::from_millis(10), fast());
        let err = checker.check(&t("pod:a#view@user:b")).await.unwrap_err();
        assert!(matches!(err, GraphError::Unavailable(_)));
        assert_eq!(graph.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn writes_are_not_retried() {
        let graph = Arc::new(Stalled { calls: AtomicU32::new(0) });
        let checker = PermissionChecker::new(graph.clone(), Duration::from_millis(10), fast());
        let write = RelationshipWrite { creates: vec![t("pod:a#creator@user:b")], ..Default::default() };
        assert!(checker.write(&write).await.is_err());
        assert_eq!(graph.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn check_any_over_fan_out() {
        let graph = Arc::new(MemoryGraph::default());
        graph.insert(t("namespace:a#viewer@group:ops")).await;
        let checker = PermissionChecker::new(graph, Duration::from_secs(1), fast());
        let fan = [t("namespace:a#view@group:dev"), t("namespace:a#view@group:ops")];
        assert!(checker.check_any(&fan).await.unwrap());
        assert!(!checker.check_any(&fan[..1]).await.unwrap());
        assert!(!checker.check_any(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn lookup_respects_limit() {
        let graph = Arc::new(MemoryGraph::default());
        for ns in ["a", "b", "c"] {
            graph.insert(t(&format!("namespace:{ns}#viewer@user:bob"))).await;
        }
        let checker =
            PermissionChecker::new(graph, Duration::from_secs(1), fast()).with_lookup_limit(2);
        let ids = checker.lookup("namespace", "view", &SubjectRef::new("user", "bob")).await.unwrap();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn preconditions_are_read_only() {
        let graph = Arc::new(MemoryGraph::default());
        graph.insert(t("pod:nginx#creator@user:alice")).await;
        let checker = PermissionChecker::new(graph.clone(), Duration::from_secs(1), fast());
        let pre = [
            Precondition::must_exist(&t("pod:nginx#creator@user:alice")),
            Precondition::must_not_exist(&t("pod:nginx#creator@user:alice")),
        ];
        assert_eq!(checker.first_failed_precondition(&pre[..1]).await.unwrap(), None);
        assert_eq!(checker.first_failed_precondition(&pre).await.unwrap(), Some(pre[1].clone()));
        assert_eq!(graph.len().await, 1);
    }
}
