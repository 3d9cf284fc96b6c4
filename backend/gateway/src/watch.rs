//! Per-connection watch filtering.
//!
//! A spawned task pulls backend events one at a time, checks each, and
//! forwards the allowed ones through a channel. The task ends when the
//! backend stream ends or the receiving side is dropped; either way the
//! backend subscription and any in-flight check are released.

use std::sync::Arc;

use futures::StreamExt;
use relgate_core::{BackendError, RequestContext, WatchEvent, WatchEventType, WatchStream};
use relgate_graph::PermissionChecker;
use relgate_rules::MatchedRules;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::filter::admit_object;

/// Everything a watch filter needs, owned by the filter task.
pub struct WatchFilter {
    pub checker: PermissionChecker,
    pub matched: MatchedRules,
    pub ctx: RequestContext,
    pub declared: Arc<Vec<String>>,
}

impl WatchFilter {
    /// Bookmarks and error notices carry no object to authorize.
    async fn admits(&self, event: &WatchEvent) -> Result<bool, BackendError> {
        match event.event_type {
            WatchEventType::Bookmark | WatchEventType::Error => Ok(true),
            _ => admit_object(&self.checker, &self.matched, &self.ctx, &event.object, &self.declared)
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string())),
        }
    }

    /// Filter `upstream`, preserving event order. Checks run strictly one
    /// after another, so a slow check delays later events but never lets
    /// them overtake it.
    pub fn spawn(self, mut upstream: WatchStream) -> WatchStream {
        let (tx, rx) = mpsc::channel::<Result<WatchEvent, BackendError>>(1);
        tokio::spawn(async move {
            let (mut forwarded, mut dropped) = (0u64, 0u64);
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = upstream.next() => next,
                };
                let Some(next) = next else { break };
                let event = match next {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Backend watch failed");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };
                let verdict = tokio::select! {
                    _ = tx.closed() => break,
                    verdict = self.admits(&event) => verdict,
                };
                match verdict {
                    Ok(true) => {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                        forwarded += 1;
                    }
                    Ok(false) => {
                        debug!(event = ?event.event_type, "Watch event filtered out");
                        dropped += 1;
                    }
                    Err(e) => {
                        // graph unavailable: stop rather than leak unchecked events
                        warn!(error = %e, "Permission check failed during watch");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            info!(forwarded, dropped, "Watch filter finished");
        });
        ReceiverStream::new(rx).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use relgate_config::parse_rules;
    use relgate_core::{
        GraphError, PermissionGraph, Permissionship, RelationshipFilter, RelationshipTuple,
        RelationshipWrite, ResourceKind, SubjectRef, UserInfo, Verb, WriteOutcome,
    };
    use relgate_graph::{MemoryGraph, RetryPolicy};
    use relgate_rules::{match_rules, RuleTable};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const RULES: &str = r#"
- match: { groupVersion: v1, resource: pods, verbs: [watch] }
  postFilter:
    - checkPermissionTemplate: "pod:{{name}}#view@user:{{user.name}}"
"#;

    fn filter(graph: Arc<dyn PermissionGraph>) -> WatchFilter {
        let ctx = RequestContext::new(Verb::Watch, ResourceKind::new("v1", "pods"), UserInfo::new("bob", vec![]));
        let table = RuleTable::compile(&parse_rules(RULES).unwrap(), &[]).unwrap();
        WatchFilter {
            checker: PermissionChecker::new(graph, Duration::from_secs(1), RetryPolicy::none()),
            matched: match_rules(&table, &ctx),
            ctx,
            declared: Arc::new(vec![]),
        }
    }

    fn event(kind: WatchEventType, name: &str) -> Result<WatchEvent, BackendError> {
        Ok(WatchEvent::new(kind, json!({"metadata": {"name": name}})))
    }

    fn names(events: &[Result<WatchEvent, BackendError>]) -> Vec<String> {
        events
            .iter()
            .map(|e| e.as_ref().unwrap().object["metadata"]["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn forwards_allowed_events_in_order() {
        let graph = Arc::new(MemoryGraph::default());
        for name in ["a", "c", "d"] {
            graph.insert(format!("pod:{name}#viewer@user:bob").parse().unwrap()).await;
        }
        let raw = vec![
            event(WatchEventType::Added, "a"),
            event(WatchEventType::Added, "b"),
            event(WatchEventType::Modified, "c"),
            event(WatchEventType::Modified, "b"),
            event(WatchEventType::Deleted, "a"),
            event(WatchEventType::Added, "d"),
        ];
        let out: Vec<_> = filter(graph).spawn(stream::iter(raw).boxed()).collect().await;
        // a subsequence of the raw events: only omissions, no reordering
        assert_eq!(names(&out), vec!["a", "c", "a", "d"]);
    }

    #[tokio::test]
    async fn backend_error_ends_stream() {
        let graph = Arc::new(MemoryGraph::default());
        graph.insert("pod:a#viewer@user:bob".parse().unwrap()).await;
        let raw = vec![
            event(WatchEventType::Added, "a"),
            Err(BackendError::Unavailable("gone".into())),
            event(WatchEventType::Added, "a"),
        ];
        let out: Vec<_> = filter(graph).spawn(stream::iter(raw).boxed()).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }

    /// A graph whose checks never return; records whether a check was dropped.
    struct Hanging {
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl PermissionGraph for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn check(&self, _: &RelationshipTuple) -> Result<Permissionship, GraphError> {
            let _guard = SetOnDrop(self.dropped.clone());
            futures::future::pending().await
        }
        async fn lookup_resources(&self, _: &str, _: &str, _: &SubjectRef, _: Option<usize>) -> Result<Vec<String>, GraphError> {
            Ok(vec![])
        }
        async fn write_relationships(&self, _: &RelationshipWrite) -> Result<WriteOutcome, GraphError> {
            Ok(WriteOutcome::Committed { revision: "0".into() })
        }
        async fn read_relationships(&self, _: &RelationshipFilter, _: Option<usize>) -> Result<Vec<RelationshipTuple>, GraphError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn dropping_client_cancels_in_flight_check() {
        let dropped = Arc::new(AtomicBool::new(false));
        let graph = Arc::new(Hanging { dropped: dropped.clone() });
        let mut f = filter(graph);
        f.checker = PermissionChecker::new(f.checker.graph().clone(), Duration::from_secs(60), RetryPolicy::none());
        let upstream = stream::iter(vec![event(WatchEventType::Added, "a")]).chain(stream::pending()).boxed();
        let out = f.spawn(upstream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(out);
        for _ in 0..50 {
            if dropped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("in-flight check was not cancelled");
    }
}
