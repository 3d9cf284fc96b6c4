//! Mutating requests as a two-step saga over the backend and the graph.
//!
//! ```text
//! Pending -> PreconditionsChecked -> BackendApplied -> GraphCommitted -> Done
//!    |                |                     |
//!    v                v                     v
//! PreconditionFailed  BackendFailed         Compensating -> Compensated { inconsistent }
//! ```
//!
//! `BackendFailed` is terminal: the backend refused the change, so nothing
//! was written anywhere and there is nothing to undo. A relationship commit
//! that fails after the backend applied its change leaves `BackendApplied`
//! for `Compensating` directly. Every exit, including a graph outage while
//! checking preconditions, ends in a terminal state.
//!
//! Preconditions are verified read-only before the backend is touched and
//! sent again with the commit. Relationship writes, creates and deletes
//! alike, happen only after the backend confirms its change. If the commit
//! fails the backend change is reversed where possible; when it cannot be,
//! the transaction ends `Compensated { inconsistent: true }` and is logged
//! at error level.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relgate_core::{
    BackendError, ObjectName, Precondition, ProxyError, RelationshipTuple,
    RelationshipWrite, RequestContext, ResourceBackend, ResourceKey, WriteOutcome,
};
use relgate_graph::PermissionChecker;
use relgate_rules::{MatchedRules, RelationshipTemplate, TemplateError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::object_context;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum TxnState {
    Pending,
    PreconditionsChecked,
    BackendApplied,
    GraphCommitted,
    Done,
    PreconditionFailed,
    BackendFailed,
    Compensating,
    Compensated { inconsistent: bool },
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::PreconditionFailed | Self::BackendFailed | Self::Compensated { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: TxnState,
    pub at: DateTime<Utc>,
}

/// The backend half of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(Value),
    Update(Value),
    Delete,
}

impl Mutation {
    fn label(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete => "delete",
        }
    }
}

/// One mutating request's saga. Owned by a single request.
#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    pub preconditions: Vec<Precondition>,
    pub creates: Vec<RelationshipTuple>,
    pub deletes: Vec<RelationshipTuple>,
    state: TxnState,
    log: Vec<Transition>,
}

impl Transaction {
    fn new(preconditions: Vec<Precondition>) -> Self {
        let mut txn = Self {
            id: Uuid::new_v4().to_string(),
            preconditions,
            creates: Vec::new(),
            deletes: Vec::new(),
            state: TxnState::Pending,
            log: Vec::new(),
        };
        txn.log.push(Transition { state: TxnState::Pending, at: Utc::now() });
        txn
    }

    fn advance(&mut self, state: TxnState) {
        debug!(txn = %self.id, from = ?self.state, to = ?state, "Transaction state");
        self.log.push(Transition { state: state.clone(), at: Utc::now() });
        self.state = state;
    }

    pub fn state(&self) -> &TxnState {
        &self.state
    }

    /// Every state entered, in order.
    pub fn log(&self) -> &[Transition] {
        &self.log
    }

    pub fn states(&self) -> Vec<TxnState> {
        self.log.iter().map(|t| t.state.clone()).collect()
    }
}

/// What a finished transaction hands back to the caller.
#[derive(Debug)]
pub struct TxnReport {
    pub txn: Transaction,
    pub result: Result<Value, ProxyError>,
}

fn render_all<'a>(
    templates: impl IntoIterator<Item = &'a RelationshipTemplate>,
    ctx: &RequestContext,
) -> Result<Vec<RelationshipTuple>, TemplateError> {
    let mut tuples = Vec::new();
    for template in templates {
        tuples.extend(template.render(ctx)?);
    }
    tuples.sort();
    tuples.dedup();
    Ok(tuples)
}

/// Drop server-assigned metadata so an object can be written back.
fn writable(mut object: Value) -> Value {
    if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("creationTimestamp");
    }
    object
}

pub struct TransactionCoordinator {
    checker: PermissionChecker,
    backend: Arc<dyn ResourceBackend>,
}

impl TransactionCoordinator {
    pub fn new(checker: PermissionChecker, backend: Arc<dyn ResourceBackend>) -> Self {
        Self { checker, backend }
    }

    /// Run `mutation` for `ctx` with the matched rules' update templates.
    pub async fn execute(
        &self,
        matched: &MatchedRules,
        ctx: &RequestContext,
        mutation: Mutation,
        declared: &[String],
    ) -> TxnReport {
        let preconditions = match self.render_preconditions(matched, ctx) {
            Ok(p) => p,
            Err(e) => {
                // the request lacks a field the precondition needs
                let mut txn = Transaction::new(Vec::new());
                txn.advance(TxnState::PreconditionFailed);
                info!(txn = %txn.id, error = %e, "Precondition not renderable; rejected before backend call");
                let result = Err(ProxyError::BadRequest(format!("precondition cannot be evaluated: {e}")));
                return TxnReport { txn, result };
            }
        };
        let mut txn = Transaction::new(preconditions);
        let result = self.run(&mut txn, matched, ctx, mutation, declared).await;
        TxnReport { txn, result }
    }

    fn render_preconditions(&self, matched: &MatchedRules, ctx: &RequestContext) -> Result<Vec<Precondition>, TemplateError> {
        let mut preconditions: Vec<Precondition> = render_all(matched.must_exist(), ctx)?
            .iter()
            .map(Precondition::must_exist)
            .collect();
        preconditions.extend(render_all(matched.must_not_exist(), ctx)?.iter().map(Precondition::must_not_exist));
        Ok(preconditions)
    }

    async fn run(
        &self,
        txn: &mut Transaction,
        matched: &MatchedRules,
        ctx: &RequestContext,
        mutation: Mutation,
        declared: &[String],
    ) -> Result<Value, ProxyError> {
        let op = mutation.label();
        match self.checker.first_failed_precondition(&txn.preconditions).await {
            Ok(None) => {}
            Ok(Some(failed)) => {
                txn.advance(TxnState::PreconditionFailed);
                info!(txn = %txn.id, precondition = %failed, "Rejected before backend call");
                return Err(ProxyError::PreconditionFailed { precondition: failed });
            }
            Err(e) => {
                // unverifiable preconditions fail closed
                txn.advance(TxnState::PreconditionFailed);
                warn!(txn = %txn.id, error = %e, "Preconditions could not be checked; rejected before backend call");
                return Err(e.into());
            }
        }
        txn.advance(TxnState::PreconditionsChecked);

        let key = ctx.key();
        // the state to restore if the commit fails after an update
        let before = match &mutation {
            Mutation::Update(_) => Some(self.backend.get(&key).await.map_err(|e| {
                txn.advance(TxnState::BackendFailed);
                ProxyError::from(e)
            })?),
            _ => None,
        };
        let applied = match self.apply(&key, mutation.clone()).await {
            Ok(object) => object,
            Err(e) => {
                txn.advance(TxnState::BackendFailed);
                warn!(txn = %txn.id, op, error = %e, "Backend rejected mutation; graph untouched");
                return Err(e.into());
            }
        };
        txn.advance(TxnState::BackendApplied);

        match self.commit(txn, matched, ctx, &applied, declared).await {
            Ok(()) => {
                txn.advance(TxnState::GraphCommitted);
                txn.advance(TxnState::Done);
                info!(
                    txn = %txn.id,
                    op,
                    creates = txn.creates.len(),
                    deletes = txn.deletes.len(),
                    "Transaction committed"
                );
                Ok(applied)
            }
            Err(cause) => {
                txn.advance(TxnState::Compensating);
                warn!(txn = %txn.id, op, error = %cause, "Relationship commit failed; compensating");
                match self.compensate(&key, &mutation, &applied, before).await {
                    Ok(()) => {
                        txn.advance(TxnState::Compensated { inconsistent: false });
                        info!(txn = %txn.id, op, "Backend change reversed");
                        Err(cause)
                    }
                    Err(e) => {
                        txn.advance(TxnState::Compensated { inconsistent: true });
                        error!(
                            inconsistent = true,
                            txn = %txn.id,
                            op,
                            object = ?ObjectName::from_object(&applied),
                            creates = ?txn.creates.iter().map(ToString::to_string).collect::<Vec<_>>(),
                            deletes = ?txn.deletes.iter().map(ToString::to_string).collect::<Vec<_>>(),
                            commit_error = %cause,
                            compensation_error = %e,
                            "Graph and backend diverged"
                        );
                        Err(ProxyError::CompensationFailed {
                            txn: txn.id.clone(),
                            reason: format!("{cause}; compensation failed: {e}"),
                        })
                    }
                }
            }
        }
    }

    async fn apply(&self, key: &ResourceKey, mutation: Mutation) -> Result<Value, BackendError> {
        match mutation {
            Mutation::Create(body) => {
                let collection = ResourceKey::collection(key.kind.clone(), key.namespace.clone());
                self.backend.create(&collection, body).await
            }
            Mutation::Update(body) => self.backend.update(key, body).await,
            Mutation::Delete => self.backend.delete(key).await,
        }
    }

    /// Render the update templates against the object the backend returned
    /// (which may carry a generated name) and write them.
    async fn commit(
        &self,
        txn: &mut Transaction,
        matched: &MatchedRules,
        ctx: &RequestContext,
        applied: &Value,
        declared: &[String],
    ) -> Result<(), ProxyError> {
        if !matched.has_updates() {
            return Ok(());
        }
        let bound = object_context(ctx, applied, declared).unwrap_or_else(|| ctx.clone());
        let template_error = |e: TemplateError| ProxyError::Template(e.to_string());
        txn.creates = render_all(matched.creates(), &bound).map_err(template_error)?;
        txn.deletes = render_all(matched.deletes(), &bound).map_err(template_error)?;
        let write = RelationshipWrite {
            creates: txn.creates.clone(),
            deletes: txn.deletes.clone(),
            preconditions: txn.preconditions.clone(),
        };
        if write.is_empty() {
            return Ok(());
        }
        match self.checker.write(&write).await? {
            WriteOutcome::Committed { revision } => {
                debug!(txn = %txn.id, revision = %revision, "Relationships written");
                Ok(())
            }
            WriteOutcome::PreconditionFailed { precondition } => {
                Err(ProxyError::PreconditionFailed { precondition })
            }
        }
    }

    /// Undo the backend half: delete what was created, restore what was
    /// deleted or overwritten.
    async fn compensate(
        &self,
        key: &ResourceKey,
        mutation: &Mutation,
        applied: &Value,
        before: Option<Value>,
    ) -> Result<(), BackendError> {
        match mutation {
            Mutation::Create(_) => {
                let created = ObjectName::from_object(applied).ok_or_else(|| BackendError::Rejected {
                    status: 500,
                    message: "created object has no name".into(),
                })?;
                let key = ResourceKey::object(key.kind.clone(), created.namespace, created.name);
                self.backend.delete(&key).await.map(drop)
            }
            Mutation::Delete => {
                let collection = ResourceKey::collection(key.kind.clone(), key.namespace.clone());
                self.backend.create(&collection, writable(applied.clone())).await.map(drop)
            }
            Mutation::Update(_) => match before {
                Some(previous) => self.backend.update(key, writable(previous)).await.map(drop),
                None => Err(BackendError::Rejected {
                    status: 500,
                    message: "no prior state recorded".into(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_config::parse_rules;
    use relgate_core::{PermissionGraph, RelationshipFilter, ResourceKind, UserInfo, Verb};
    use relgate_graph::{MemoryGraph, RetryPolicy};
    use relgate_rules::{match_rules, RuleTable};
    use relgate_store::{MemoryStore, Operation};
    use serde_json::json;
    use std::time::Duration;

    const RULES: &str = r#"
- match: { groupVersion: v1, resource: pods, verbs: [create] }
  update:
    preconditionDoesNotExist: ["pod:{{resourceId}}#creator@user:{{user.name}}"]
    createRelationships: ["pod:{{resourceId}}#creator@user:{{user.name}}"]
- match: { groupVersion: v1, resource: pods, verbs: [delete] }
  update:
    preconditionExists: ["pod:{{resourceId}}#creator@user:{{user.name}}"]
    deleteRelationships: ["pod:{{resourceId}}#creator@user:{{user.name}}"]
"#;

    struct Fixture {
        graph: Arc<MemoryGraph>,
        store: Arc<MemoryStore>,
        coordinator: TransactionCoordinator,
        table: RuleTable,
    }

    fn fixture() -> Fixture {
        let graph = Arc::new(MemoryGraph::default());
        let store = Arc::new(MemoryStore::new());
        let checker = PermissionChecker::new(graph.clone(), Duration::from_secs(1), RetryPolicy::none());
        Fixture {
            coordinator: TransactionCoordinator::new(checker, store.clone()),
            table: RuleTable::compile(&parse_rules(RULES).unwrap(), &[]).unwrap(),
            graph,
            store,
        }
    }

    fn pods() -> ResourceKind {
        ResourceKind::new("v1", "pods")
    }

    fn ctx(verb: Verb) -> RequestContext {
        RequestContext::new(verb, pods(), UserInfo::new("alice", vec![]))
            .with_namespace(Some("a".into()))
            .with_name(Some("nginx".into()))
    }

    fn nginx() -> Value {
        json!({"metadata": {"name": "nginx", "namespace": "a"}})
    }

    fn creator() -> RelationshipTuple {
        "pod:a/nginx#creator@user:alice".parse().unwrap()
    }

    async fn run(f: &Fixture, verb: Verb, mutation: Mutation) -> TxnReport {
        let ctx = ctx(verb);
        let matched = match_rules(&f.table, &ctx);
        f.coordinator.execute(&matched, &ctx, mutation, &[]).await
    }

    #[tokio::test]
    async fn create_commits_after_backend() {
        let f = fixture();
        let report = run(&f, Verb::Create, Mutation::Create(nginx())).await;
        assert!(report.result.is_ok());
        assert_eq!(
            report.txn.states(),
            vec![
                TxnState::Pending,
                TxnState::PreconditionsChecked,
                TxnState::BackendApplied,
                TxnState::GraphCommitted,
                TxnState::Done
            ]
        );
        assert!(report.txn.state().is_terminal());
        assert!(f.graph.contains(&creator()).await);
        assert_eq!(f.store.count(&pods()).await, 1);
    }

    #[tokio::test]
    async fn backend_failure_leaves_graph_untouched() {
        let f = fixture();
        let before = f.graph.read_relationships(&RelationshipFilter::default(), None).await.unwrap();
        f.store.fail_next(Operation::Create, BackendError::already_exists("pod nginx"));
        let report = run(&f, Verb::Create, Mutation::Create(nginx())).await;
        assert_eq!(report.result.unwrap_err().status_code(), 409);
        assert_eq!(report.txn.state(), &TxnState::BackendFailed);
        let after = f.graph.read_relationships(&RelationshipFilter::default(), None).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn failed_precondition_skips_backend() {
        let f = fixture();
        f.graph.insert(creator()).await;
        let report = run(&f, Verb::Create, Mutation::Create(nginx())).await;
        assert_eq!(report.result.unwrap_err().status_code(), 409);
        assert_eq!(report.txn.state(), &TxnState::PreconditionFailed);
        assert_eq!(f.store.count(&pods()).await, 0);
    }

    #[tokio::test]
    async fn graph_outage_during_preconditions_is_terminal() {
        let f = fixture();
        f.graph.set_unavailable(true);
        let report = run(&f, Verb::Create, Mutation::Create(nginx())).await;
        assert_eq!(report.result.unwrap_err().status_code(), 503);
        assert_eq!(report.txn.states(), vec![TxnState::Pending, TxnState::PreconditionFailed]);
        assert!(report.txn.state().is_terminal());
        assert_eq!(f.store.count(&pods()).await, 0);
    }

    #[tokio::test]
    async fn unrenderable_precondition_is_a_client_error() {
        let f = fixture();
        // no name yet, so `resourceId` cannot be bound
        let ctx = RequestContext::new(Verb::Create, pods(), UserInfo::new("alice", vec![]))
            .with_namespace(Some("a".into()));
        let body = json!({"metadata": {"generateName": "web-", "namespace": "a"}});
        let report = f.coordinator.execute(&match_rules(&f.table, &ctx), &ctx, Mutation::Create(body), &[]).await;
        assert_eq!(report.result.unwrap_err().status_code(), 400);
        assert_eq!(report.txn.states(), vec![TxnState::Pending, TxnState::PreconditionFailed]);
        assert_eq!(f.store.count(&pods()).await, 0);
    }

    #[tokio::test]
    async fn commit_failure_deletes_created_object() {
        let f = fixture();
        f.graph.set_fail_writes(true);
        let report = run(&f, Verb::Create, Mutation::Create(nginx())).await;
        assert_eq!(report.result.unwrap_err().status_code(), 503);
        assert_eq!(
            report.txn.states(),
            vec![
                TxnState::Pending,
                TxnState::PreconditionsChecked,
                TxnState::BackendApplied,
                TxnState::Compensating,
                TxnState::Compensated { inconsistent: false },
            ]
        );
        assert_eq!(f.store.count(&pods()).await, 0);
    }

    #[tokio::test]
    async fn failed_compensation_is_flagged() {
        let f = fixture();
        f.graph.set_fail_writes(true);
        f.store.fail_next(Operation::Delete, BackendError::Unavailable("down".into()));
        let report = run(&f, Verb::Create, Mutation::Create(nginx())).await;
        let err = report.result.unwrap_err();
        assert!(matches!(err, ProxyError::CompensationFailed { .. }));
        assert_eq!(err.status_code(), 500);
        assert_eq!(report.txn.state(), &TxnState::Compensated { inconsistent: true });
        assert_eq!(f.store.count(&pods()).await, 1);
    }

    #[tokio::test]
    async fn delete_removes_relationship_after_backend() {
        let f = fixture();
        f.store.put(&pods(), nginx()).await;
        f.graph.insert(creator()).await;
        let report = run(&f, Verb::Delete, Mutation::Delete).await;
        assert!(report.result.is_ok());
        assert!(!f.graph.contains(&creator()).await);
        assert_eq!(f.store.count(&pods()).await, 0);
    }

    #[tokio::test]
    async fn failed_delete_commit_restores_object() {
        let f = fixture();
        f.store.put(&pods(), nginx()).await;
        f.graph.insert(creator()).await;
        f.graph.set_fail_writes(true);
        let report = run(&f, Verb::Delete, Mutation::Delete).await;
        assert!(report.result.is_err());
        assert_eq!(report.txn.state(), &TxnState::Compensated { inconsistent: false });
        assert_eq!(f.store.count(&pods()).await, 1);
        assert!(f.graph.contains(&creator()).await);
    }

    #[tokio::test]
    async fn generated_name_binds_relationships() {
        let f = fixture();
        let body = json!({"metadata": {"generateName": "web-", "namespace": "a"}});
        let ctx = RequestContext::new(Verb::Create, pods(), UserInfo::new("alice", vec![]))
            .with_namespace(Some("a".into()));
        let rules = r#"
- match: { groupVersion: v1, resource: pods, verbs: [create] }
  update:
    createRelationships: ["pod:{{resourceId}}#creator@user:{{user.name}}"]
"#;
        let table = RuleTable::compile(&parse_rules(rules).unwrap(), &[]).unwrap();
        let report = f.coordinator.execute(&match_rules(&table, &ctx), &ctx, Mutation::Create(body), &[]).await;
        let created = report.result.unwrap();
        let name = created["metadata"]["name"].as_str().unwrap();
        assert!(name.starts_with("web-"));
        let tuple: RelationshipTuple = format!("pod:a/{name}#creator@user:alice").parse().unwrap();
        assert!(f.graph.contains(&tuple).await);
    }
}
