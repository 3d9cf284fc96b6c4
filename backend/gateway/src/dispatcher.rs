//! Per-request pipeline: match rules, run checks, then read through the
//! filters or write through the transaction coordinator.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use relgate_config::PolicyConfig;
use relgate_core::{
    ListFilter, ProxyError, RequestContext, ResourceBackend, UserInfo, Verb, WatchStream,
};
use relgate_graph::PermissionChecker;
use relgate_rules::{match_rules, MatchedRules, RuleStore};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::context::ApiRequest;
use crate::filter::{admit_object, all_allowed, post_filter, pre_filter, Narrowing};
use crate::txn::{Mutation, TransactionCoordinator};
use crate::watch::WatchFilter;

/// What the dispatcher hands back for a request.
pub enum Reply {
    Object(Value),
    List(Vec<Value>),
    Watch(WatchStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(o) => f.debug_tuple("Object").field(o).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Watch(_) => f.write_str("Watch(..)"),
        }
    }
}

pub struct Dispatcher {
    rules: RuleStore,
    checker: PermissionChecker,
    backend: Arc<dyn ResourceBackend>,
    coordinator: TransactionCoordinator,
    allow_unmatched: bool,
}

impl Dispatcher {
    pub fn new(
        rules: RuleStore,
        checker: PermissionChecker,
        backend: Arc<dyn ResourceBackend>,
        policy: &PolicyConfig,
    ) -> Self {
        if policy.allow_unmatched {
            warn!("Requests matching no rule will be forwarded unchecked");
        }
        Self {
            coordinator: TransactionCoordinator::new(checker.clone(), backend.clone()),
            rules,
            checker,
            backend,
            allow_unmatched: policy.allow_unmatched,
        }
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn checker(&self) -> &PermissionChecker {
        &self.checker
    }

    #[instrument(
        name = "dispatch",
        skip_all,
        fields(verb = %req.verb, resource = %req.kind, user = %user.name)
    )]
    pub async fn dispatch(&self, req: ApiRequest, user: UserInfo) -> Result<Reply, ProxyError> {
        let declared = self.rules.declared_fields();
        let ctx = req.context(user, declared);
        let table = self.rules.snapshot().await;
        let matched = match_rules(&table, &ctx);

        if matched.is_empty() {
            if !self.allow_unmatched {
                info!("No rule matched; denying");
                return Err(ProxyError::RuleNotMatched(format!("{} {}", ctx.verb, ctx.kind)));
            }
            debug!("No rule matched; forwarding by policy");
        } else {
            debug!(rules = ?matched.names(), "Rules matched");
        }

        if !all_allowed(&self.checker, matched.checks(), &ctx).await? {
            info!(object = ctx.resource_id().as_deref().unwrap_or("*"), "Check denied");
            return Err(ProxyError::PermissionDenied(describe(&ctx)));
        }

        match ctx.verb {
            Verb::Get => {
                require_name(&ctx)?;
                let object = self.backend.get(&ctx.key()).await?;
                if !self.visible(&matched, &ctx, &object).await? {
                    info!(object = ctx.resource_id().as_deref().unwrap_or("*"), "Post-filter denied object");
                    return Err(ProxyError::PermissionDenied(describe(&ctx)));
                }
                Ok(Reply::Object(object))
            }
            Verb::List => self.list(&matched, &ctx).await.map(Reply::List),
            Verb::Watch => self.watch(matched, ctx).await.map(Reply::Watch),
            Verb::Create => {
                let body = req.body.ok_or_else(|| ProxyError::BadRequest("create needs a body".into()))?;
                self.mutate(&matched, &ctx, Mutation::Create(body)).await
            }
            Verb::Update => {
                require_name(&ctx)?;
                let body = req.body.ok_or_else(|| ProxyError::BadRequest("update needs a body".into()))?;
                self.mutate(&matched, &ctx, Mutation::Update(body)).await
            }
            Verb::Patch => {
                require_name(&ctx)?;
                let patch = req.body.ok_or_else(|| ProxyError::BadRequest("patch needs a body".into()))?;
                let mut current = self.backend.get(&ctx.key()).await?;
                merge_patch(&mut current, &patch);
                self.mutate(&matched, &ctx, Mutation::Update(current)).await
            }
            Verb::Delete => {
                require_name(&ctx)?;
                self.mutate(&matched, &ctx, Mutation::Delete).await
            }
        }
    }

    /// A single fetched object goes through the same post-filters as a list item.
    async fn visible(&self, matched: &MatchedRules, ctx: &RequestContext, object: &Value) -> Result<bool, ProxyError> {
        if matched.post_filters().next().is_none() {
            return Ok(true);
        }
        Ok(admit_object(&self.checker, matched, ctx, object, self.rules.declared_fields()).await?)
    }

    async fn list(&self, matched: &MatchedRules, ctx: &RequestContext) -> Result<Vec<Value>, ProxyError> {
        let filter = match pre_filter(&self.checker, matched, ctx).await? {
            Narrowing::Empty => return Ok(Vec::new()),
            Narrowing::Query(filter) => filter,
        };
        let items = self.backend.list(&ctx.kind, &filter).await?;
        Ok(post_filter(&self.checker, matched, ctx, items, self.rules.declared_fields()).await?)
    }

    async fn watch(&self, matched: MatchedRules, ctx: RequestContext) -> Result<WatchStream, ProxyError> {
        let filter: ListFilter = match pre_filter(&self.checker, &matched, &ctx).await? {
            Narrowing::Empty => return Ok(stream::empty().boxed()),
            Narrowing::Query(filter) => filter,
        };
        let upstream = self.backend.watch(&ctx.kind, &filter).await?;
        if matched.post_filters().next().is_none() {
            return Ok(upstream);
        }
        let filter = WatchFilter {
            checker: self.checker.clone(),
            matched,
            ctx,
            declared: Arc::new(self.rules.declared_fields().to_vec()),
        };
        Ok(filter.spawn(upstream))
    }

    async fn mutate(&self, matched: &MatchedRules, ctx: &RequestContext, mutation: Mutation) -> Result<Reply, ProxyError> {
        let report = self
            .coordinator
            .execute(matched, ctx, mutation, self.rules.declared_fields())
            .await;
        debug!(txn = %report.txn.id, state = ?report.txn.state(), "Transaction finished");
        report.result.map(Reply::Object)
    }
}

fn require_name(ctx: &RequestContext) -> Result<(), ProxyError> {
    match ctx.name {
        Some(_) => Ok(()),
        None => Err(ProxyError::BadRequest(format!("{} needs an object name", ctx.verb))),
    }
}

fn describe(ctx: &RequestContext) -> String {
    match ctx.resource_id() {
        Some(id) => format!("{} {} {id}", ctx.verb, ctx.kind.resource),
        None => format!("{} {}", ctx.verb, ctx.kind.resource),
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a key, any
/// other value replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
