//! Resource filtering for reads.
//!
//! Pre-filters turn a bulk lookup into a name restriction before the backend
//! is asked; post-filters check each returned item on its own. Both fail
//! closed: a template that cannot be rendered for an item drops the item.

use std::collections::BTreeSet;

use relgate_core::{GraphError, ListFilter, ObjectName, RequestContext};
use relgate_graph::PermissionChecker;
use relgate_rules::{MatchedRules, PreFilter, RelationshipTemplate};
use serde_json::Value;
use tracing::debug;

use crate::context::object_context;

/// Result of pre-filtering a list or watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Narrowing {
    /// Ask the backend with this filter.
    Query(ListFilter),
    /// The caller can see nothing; skip the backend.
    Empty,
}

/// True when every template renders against `ctx` and each renders to at
/// least one allowed tuple. Fan-out tuples (one per group) need only one hit.
pub async fn all_allowed<'a>(
    checker: &PermissionChecker,
    templates: impl IntoIterator<Item = &'a RelationshipTemplate>,
    ctx: &RequestContext,
) -> Result<bool, GraphError> {
    for template in templates {
        let tuples = match template.render(ctx) {
            Ok(tuples) => tuples,
            Err(e) => {
                debug!(error = %e, "Template not renderable; denying");
                return Ok(false);
            }
        };
        if !checker.check_any(&tuples).await? {
            debug!(template = template.source(), "Check denied");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Objects reachable through one pre-filter, unioned over every rendered
/// lookup (a `user.groups` lookup fans out to one query per group).
async fn reachable(
    checker: &PermissionChecker,
    pre: &PreFilter,
    ctx: &RequestContext,
) -> Result<BTreeSet<ObjectName>, GraphError> {
    let queries = match pre.lookup.render_lookup(ctx) {
        Ok(queries) => queries,
        Err(e) => {
            debug!(error = %e, "Lookup template not renderable; nothing reachable");
            return Ok(BTreeSet::new());
        }
    };
    let mut objects = BTreeSet::new();
    for query in queries {
        let ids = checker
            .lookup(&query.resource_type, &query.permission, &query.subject)
            .await?;
        objects.extend(ids.iter().filter_map(|id| pre.object_for(id)));
    }
    Ok(objects)
}

/// Narrow a list/watch by the matched rules' pre-filters. Several pre-filters
/// intersect. With none, only the request namespace applies. A looked-up id
/// that carries no namespace binds to the request namespace, or matches the
/// name in any namespace when the request spans all of them.
pub async fn pre_filter(
    checker: &PermissionChecker,
    matched: &MatchedRules,
    ctx: &RequestContext,
) -> Result<Narrowing, GraphError> {
    let mut filter = ListFilter::namespace(ctx.namespace.clone());
    for pre in matched.pre_filters() {
        let mut found = reachable(checker, pre, ctx).await?;
        if let Some(ns) = &ctx.namespace {
            // ids without a namespace part name objects in the request namespace
            found = found
                .into_iter()
                .map(|o| match o.namespace {
                    Some(_) => o,
                    None => ObjectName::new(Some(ns.clone()), o.name),
                })
                .filter(|o| o.namespace.as_ref() == Some(ns))
                .collect();
        }
        let narrowed = match filter.names.take() {
            Some(previous) => previous.intersection(&found).cloned().collect(),
            None => found,
        };
        filter.names = Some(narrowed);
    }
    match &filter.names {
        Some(names) if names.is_empty() => {
            debug!("Pre-filter left nothing visible");
            Ok(Narrowing::Empty)
        }
        Some(names) => {
            debug!(visible = names.len(), "Pre-filter narrowed query");
            Ok(Narrowing::Query(filter))
        }
        None => Ok(Narrowing::Query(filter)),
    }
}

/// Does `object` pass every post-filter when checked on its own?
pub async fn admit_object(
    checker: &PermissionChecker,
    matched: &MatchedRules,
    ctx: &RequestContext,
    object: &Value,
    declared: &[String],
) -> Result<bool, GraphError> {
    let Some(item_ctx) = object_context(ctx, object, declared) else {
        return Ok(false);
    };
    all_allowed(checker, matched.post_filters(), &item_ctx).await
}

/// Drop the items that fail a post-filter, keeping the rest in order.
pub async fn post_filter(
    checker: &PermissionChecker,
    matched: &MatchedRules,
    ctx: &RequestContext,
    items: Vec<Value>,
    declared: &[String],
) -> Result<Vec<Value>, GraphError> {
    if matched.post_filters().next().is_none() {
        return Ok(items);
    }
    let total = items.len();
    let mut kept = Vec::with_capacity(total);
    for item in items {
        if admit_object(checker, matched, ctx, &item, declared).await? {
            kept.push(item);
        }
    }
    debug!(total, kept = kept.len(), "Post-filtered list");
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_config::parse_rules;
    use relgate_core::{ResourceKind, UserInfo, Verb};
    use relgate_graph::{MemoryGraph, RetryPolicy};
    use relgate_rules::{match_rules, RuleTable};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn checker(tuples: &[&str]) -> PermissionChecker {
        let graph = Arc::new(MemoryGraph::default());
        for t in tuples {
            graph.insert(t.parse().unwrap()).await;
        }
        PermissionChecker::new(graph, Duration::from_secs(1), RetryPolicy::none())
    }

    fn matched(rules: &str, ctx: &RequestContext) -> MatchedRules {
        let table = RuleTable::compile(&parse_rules(rules).unwrap(), &[]).unwrap();
        match_rules(&table, ctx)
    }

    fn list_ctx(user: &str) -> RequestContext {
        RequestContext::new(Verb::List, ResourceKind::new("v1", "namespaces"), UserInfo::new(user, vec![]))
    }

    const PRE: &str = r#"
- match: { groupVersion: v1, resource: namespaces, verbs: [list] }
  preFilter:
    fromObjectIdNameExpr: "{{resourceId}}"
    lookupMatchingResources: "namespace:$#view@user:{{user.name}}"
"#;

    #[tokio::test]
    async fn pre_filter_restricts_to_lookup_results() {
        let checker = checker(&["namespace:a#viewer@user:bob", "namespace:c#viewer@user:bob"]).await;
        let ctx = list_ctx("bob");
        let Narrowing::Query(filter) = pre_filter(&checker, &matched(PRE, &ctx), &ctx).await.unwrap() else {
            panic!("expected a query");
        };
        let names: Vec<_> = filter.names.unwrap().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn empty_lookup_short_circuits() {
        let checker = checker(&[]).await;
        let ctx = list_ctx("bob");
        assert_eq!(pre_filter(&checker, &matched(PRE, &ctx), &ctx).await.unwrap(), Narrowing::Empty);
    }

    #[tokio::test]
    async fn no_pre_filter_keeps_namespace_only() {
        let checker = checker(&[]).await;
        let ctx = list_ctx("bob").with_namespace(Some("team".into()));
        let rules = "- match: { groupVersion: v1, resource: namespaces, verbs: [list] }\n";
        let narrowing = pre_filter(&checker, &matched(rules, &ctx), &ctx).await.unwrap();
        assert_eq!(narrowing, Narrowing::Query(ListFilter::namespace(Some("team".into()))));
    }

    #[tokio::test]
    async fn bare_ids_bind_to_request_namespace() {
        let checker = checker(&["pod:nginx#viewer@user:bob"]).await;
        let rules = r#"
- match: { groupVersion: v1, resource: pods, verbs: [list] }
  preFilter:
    fromObjectIdNameExpr: "{{resourceId}}"
    lookupMatchingResources: "pod:$#view@user:{{user.name}}"
"#;
        let ctx = RequestContext::new(Verb::List, ResourceKind::new("v1", "pods"), UserInfo::new("bob", vec![]))
            .with_namespace(Some("a".into()));
        let Narrowing::Query(filter) = pre_filter(&checker, &matched(rules, &ctx), &ctx).await.unwrap() else {
            panic!("expected a query");
        };
        assert!(filter.admits(&json!({"metadata": {"name": "nginx", "namespace": "a"}})));
        assert!(!filter.admits(&json!({"metadata": {"name": "other", "namespace": "a"}})));
    }

    #[tokio::test]
    async fn post_filter_keeps_order_and_only_allowed() {
        let checker = checker(&["namespace:c#viewer@user:bob", "namespace:a#viewer@user:bob"]).await;
        let ctx = list_ctx("bob");
        let rules = r#"
- match: { groupVersion: v1, resource: namespaces, verbs: [list] }
  postFilter:
    - checkPermissionTemplate: "namespace:{{name}}#view@user:{{user.name}}"
"#;
        let matched = matched(rules, &ctx);
        let items = ["a", "b", "c"].map(|n| json!({"metadata": {"name": n}})).to_vec();
        let kept = post_filter(&checker, &matched, &ctx, items, &[]).await.unwrap();
        let names: Vec<_> = kept.iter().map(|o| o["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "c"]);

        // every kept item passes a direct check on its own
        for item in &kept {
            assert!(admit_object(&checker, &matched, &ctx, item, &[]).await.unwrap());
        }
    }

    #[tokio::test]
    async fn unnamed_item_is_dropped() {
        let checker = checker(&["namespace:a#viewer@user:bob"]).await;
        let ctx = list_ctx("bob");
        let rules = r#"
- match: { groupVersion: v1, resource: namespaces, verbs: [list] }
  postFilter:
    - checkPermissionTemplate: "namespace:{{name}}#view@user:{{user.name}}"
"#;
        let kept = post_filter(&checker, &matched(rules, &ctx), &ctx, vec![json!({"spec": {}})], &[])
            .await
            .unwrap();
        assert!(kept.is_empty());
    }
}
