//! HTTP surface.
//!
//! Anything under `/api` or `/apis` is parsed as a resource request and sent
//! through the [`Dispatcher`]. Operator endpoints live under `/-/`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use relgate_core::{
    ProxyError, RelationshipFilter, RelationshipTuple, RelationshipWrite, ResourceKind, Verb,
    WatchEvent, WatchEventType, WriteOutcome,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::Identity;
use crate::config_reload::RuleReloader;
use crate::context::ApiRequest;
use crate::dispatcher::{Dispatcher, Reply};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`ProxyError`] rendered as a Kubernetes-style `Status` body.
#[derive(Debug)]
pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

fn status_body(err: &ProxyError) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": err.to_string(),
        "reason": err.reason(),
        "code": err.status_code(),
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(status_body(&self.0))).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Application state shared across routes.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher>,
    pub reloader: RuleReloader,
    pub admin_groups: Arc<Vec<String>>,
    pub shutdown: watch::Receiver<bool>,
}

impl GatewayState {
    fn require_admin(&self, identity: &Identity) -> Result<(), ApiError> {
        let user = &identity.0;
        if self.admin_groups.iter().any(|g| user.in_group(g)) {
            return Ok(());
        }
        warn!(user = %user.name, "Operator endpoint refused");
        Err(ProxyError::PermissionDenied(format!("{} is not in an admin group", user.name)).into())
    }
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ProxyParams {
    #[serde(default)]
    pub watch: Option<String>,
}

impl ProxyParams {
    fn is_watch(&self) -> bool {
        matches!(self.watch.as_deref(), Some("true" | "1"))
    }
}

/// Map a method and `/api[s]/...` path onto an [`ApiRequest`].
pub fn parse_api_path(method: &Method, path: &str, watch: bool) -> Result<ApiRequest, ProxyError> {
    let bad = || ProxyError::BadRequest(format!("unsupported path {path}"));
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let (group_version, rest) = match segments.as_slice() {
        ["api", version, rest @ ..] => (version.to_string(), rest),
        ["apis", group, version, rest @ ..] => (format!("{group}/{version}"), rest),
        _ => return Err(bad()),
    };
    let (namespace, resource, name) = match rest {
        ["namespaces", ns, resource, tail @ ..] => (Some(*ns), *resource, tail),
        [resource, tail @ ..] => (None, *resource, tail),
        [] => return Err(bad()),
    };
    let name = match name {
        [] => None,
        [name] => Some(*name),
        _ => return Err(bad()),
    };

    let verb = match (method, name) {
        (&Method::GET, Some(_)) => Verb::Get,
        (&Method::GET, None) if watch => Verb::Watch,
        (&Method::GET, None) => Verb::List,
        (&Method::POST, None) => Verb::Create,
        (&Method::PUT, Some(_)) => Verb::Update,
        (&Method::PATCH, Some(_)) => Verb::Patch,
        (&Method::DELETE, Some(_)) => Verb::Delete,
        _ => return Err(ProxyError::BadRequest(format!("{method} not supported on {path}"))),
    };
    let mut req = ApiRequest::new(verb, ResourceKind::new(group_version, resource));
    req.namespace = namespace.map(String::from);
    req.name = name.map(String::from);
    Ok(req)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn proxy(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    Query(params): Query<ProxyParams>,
    identity: Identity,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut req = parse_api_path(&method, uri.path(), params.is_watch())?;
    if !body.is_empty() {
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::BadRequest(format!("body is not JSON: {e}")))?;
        req.body = Some(value);
    }
    let verb = req.verb;
    let group_version = req.kind.group_version.clone();

    let reply = state.dispatcher.dispatch(req, identity.0).await?;
    Ok(match reply {
        Reply::Object(object) if verb == Verb::Create => (StatusCode::CREATED, Json(object)).into_response(),
        Reply::Object(object) => Json(object).into_response(),
        Reply::List(items) => Json(json!({
            "apiVersion": group_version,
            "kind": "List",
            "metadata": {},
            "items": items,
        }))
        .into_response(),
        Reply::Watch(events) => watch_response(events, state.shutdown.clone()),
    })
}

/// Stream events as JSON lines until the stream or the server ends.
fn watch_response(events: relgate_core::WatchStream, mut shutdown: watch::Receiver<bool>) -> Response {
    let stopped = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    };
    let lines = events.take_until(stopped).map(|event| {
        let event = event.unwrap_or_else(|e| {
            WatchEvent::new(WatchEventType::Error, status_body(&ProxyError::from(e)))
        });
        let mut line = serde_json::to_string(&event).unwrap_or_default();
        line.push('\n');
        Ok::<_, std::convert::Infallible>(line)
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

/// `GET /-/relationships?limit=N`: stored relationships as JSON lines.
async fn list_relationships(
    State(state): State<GatewayState>,
    Query(params): Query<LimitParams>,
    identity: Identity,
) -> Result<Response, ApiError> {
    state.require_admin(&identity)?;
    let limit = params.limit.unwrap_or(100);
    let tuples = state
        .dispatcher
        .checker()
        .read(&RelationshipFilter::default(), Some(limit))
        .await
        .map_err(ProxyError::from)?;
    let mut body = String::new();
    for tuple in &tuples {
        body.push_str(&json!({ "relationship": tuple.to_string() }).to_string());
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub relationships: Vec<String>,
}

/// `POST /-/relationships`: write explicit relationships.
async fn grant_relationships(
    State(state): State<GatewayState>,
    identity: Identity,
    Json(grant): Json<GrantRequest>,
) -> Result<Response, ApiError> {
    state.require_admin(&identity)?;
    let creates = grant
        .relationships
        .iter()
        .map(|raw| raw.parse::<RelationshipTuple>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    let write = RelationshipWrite { creates, ..Default::default() };
    let outcome = state.dispatcher.checker().write(&write).await.map_err(ProxyError::from)?;
    match outcome {
        WriteOutcome::Committed { revision } => {
            info!(user = %identity.0.name, count = write.creates.len(), revision = %revision, "Relationships granted");
            Ok((StatusCode::CREATED, Json(json!({ "revision": revision }))).into_response())
        }
        WriteOutcome::PreconditionFailed { precondition } => {
            Err(ProxyError::PreconditionFailed { precondition }.into())
        }
    }
}

/// `POST /-/reload`: recompile rules now.
async fn reload_rules(State(state): State<GatewayState>, identity: Identity) -> Result<Response, ApiError> {
    state.require_admin(&identity)?;
    let count = state
        .reloader
        .reload()
        .await
        .map_err(|e| ProxyError::Config(format!("{e:#}")))?;
    Ok(Json(json!({ "rules": count })).into_response())
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ready" }))
        .route("/-/relationships", get(list_relationships).post(grant_relationships))
        .route("/-/reload", post(reload_rules))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn start_server(addr: SocketAddr, state: GatewayState) -> Result<()> {
    let mut shutdown = state.shutdown.clone();
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Stopping HTTP server");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{GROUPS_HEADER, USER_HEADER};
    use axum::http::Request;
    use relgate_config::{parse_rules, PolicyConfig, RulesConfig};
    use relgate_graph::{MemoryGraph, PermissionChecker, RetryPolicy};
    use relgate_rules::RuleStore;
    use relgate_store::MemoryStore;
    use std::time::Duration;
    use tower::ServiceExt;

    const RULES: &str = r#"
- match: { groupVersion: v1, resource: pods, verbs: [create] }
  update:
    createRelationships: ["pod:{{resourceId}}#creator@user:{{user.name}}"]
- match: { groupVersion: v1, resource: pods, verbs: [get, list, watch] }
  postFilter:
    - checkPermissionTemplate: "pod:{{resourceId}}#view@user:{{user.name}}"
"#;

    struct App {
        router: Router,
        graph: Arc<MemoryGraph>,
        store: Arc<MemoryStore>,
        stop: watch::Sender<bool>,
    }

    fn app() -> App {
        let graph = Arc::new(MemoryGraph::default());
        let store = Arc::new(MemoryStore::new());
        let checker = PermissionChecker::new(graph.clone(), Duration::from_secs(1), RetryPolicy::none());
        let rules = RuleStore::compile(&parse_rules(RULES).unwrap(), vec![]).unwrap();
        let dispatcher = Dispatcher::new(rules.clone(), checker, store.clone(), &PolicyConfig::default());
        let (stop, shutdown) = watch::channel(false);
        let state = GatewayState {
            dispatcher: Arc::new(dispatcher),
            reloader: RuleReloader::new(rules, RulesConfig::default()),
            admin_groups: Arc::new(vec!["admins".into()]),
            shutdown,
        };
        App { router: build_router(state), graph, store, stop }
    }

    fn request(method: &str, uri: &str, user: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, user)
            .header(GROUPS_HEADER, if user == "root" { "admins" } else { "dev" });
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn read_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn parses_paths() {
        let req = parse_api_path(&Method::GET, "/api/v1/namespaces/a/pods/web", false).unwrap();
        assert_eq!((req.verb, req.kind.group_version.as_str(), req.kind.resource.as_str()), (Verb::Get, "v1", "pods"));
        assert_eq!((req.namespace.as_deref(), req.name.as_deref()), (Some("a"), Some("web")));

        let req = parse_api_path(&Method::GET, "/apis/apps/v1/deployments", true).unwrap();
        assert_eq!((req.verb, req.kind.group_version.as_str()), (Verb::Watch, "apps/v1"));

        let req = parse_api_path(&Method::GET, "/api/v1/namespaces/team-a", false).unwrap();
        assert_eq!((req.kind.resource.as_str(), req.name.as_deref(), req.namespace), ("namespaces", Some("team-a"), None));

        let req = parse_api_path(&Method::POST, "/api/v1/namespaces", false).unwrap();
        assert_eq!(req.verb, Verb::Create);

        assert!(parse_api_path(&Method::GET, "/api/v1/namespaces/a/pods/web/log", false).is_err());
        assert!(parse_api_path(&Method::DELETE, "/api/v1/pods", false).is_err());
        assert!(parse_api_path(&Method::GET, "/metrics", false).is_err());
    }

    #[tokio::test]
    async fn health_endpoints_need_no_identity() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_identity_is_401() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::builder().uri("/api/v1/pods").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(read_json(response).await["reason"], "Unauthorized");
    }

    #[tokio::test]
    async fn create_then_list_shows_only_own_pods() {
        let app = app();
        let created = app
            .router
            .clone()
            .oneshot(request("POST", "/api/v1/namespaces/a/pods", "alice", Some(json!({"metadata": {"name": "web"}}))))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        assert!(app.graph.contains(&"pod:a/web#creator@user:alice".parse().unwrap()).await);
        app.store.put(&ResourceKind::new("v1", "pods"), json!({"metadata": {"name": "db", "namespace": "a"}})).await;

        let listed = read_json(app.router.clone().oneshot(request("GET", "/api/v1/namespaces/a/pods", "alice", None)).await.unwrap()).await;
        let names: Vec<_> = listed["items"].as_array().unwrap().iter().map(|o| o["metadata"]["name"].clone()).collect();
        assert_eq!(names, vec![json!("web")]);

        let other = read_json(app.router.oneshot(request("GET", "/api/v1/namespaces/a/pods", "bob", None)).await.unwrap()).await;
        assert!(other["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmatched_request_is_forbidden() {
        let app = app();
        let response = app
            .router
            .oneshot(request("DELETE", "/api/v1/namespaces/a/pods/web", "alice", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn grant_requires_admin_group() {
        let app = app();
        let body = json!({"relationships": ["pod:a/web#viewer@user:bob"]});
        let denied = app
            .router
            .clone()
            .oneshot(request("POST", "/-/relationships", "bob", Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let granted = app.router.oneshot(request("POST", "/-/relationships", "root", Some(body))).await.unwrap();
        assert_eq!(granted.status(), StatusCode::CREATED);
        assert!(app.graph.contains(&"pod:a/web#viewer@user:bob".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn watch_streams_allowed_events_and_ends_on_shutdown() {
        let app = app();
        let pods = ResourceKind::new("v1", "pods");
        app.store.put(&pods, json!({"metadata": {"name": "web", "namespace": "a"}})).await;
        app.store.put(&pods, json!({"metadata": {"name": "db", "namespace": "a"}})).await;
        app.graph.insert("pod:a/db#viewer@user:bob".parse().unwrap()).await;

        let response = app
            .router
            .oneshot(request("GET", "/api/v1/namespaces/a/pods?watch=true", "bob", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        app.stop.send(true).unwrap();
        let bytes = tokio::time::timeout(Duration::from_secs(2), axum::body::to_bytes(response.into_body(), usize::MAX))
            .await
            .unwrap()
            .unwrap();
        let lines: Vec<Value> = String::from_utf8_lossy(&bytes)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(lines.iter().all(|e| e["object"]["metadata"]["name"] == "db"));
    }
}
