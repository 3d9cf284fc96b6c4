//! Kubernetes-style REST client.
//!
//! Core-group kinds live under `/api/{version}`, everything else under
//! `/apis/{group}/{version}`. Watches are `?watch=true` requests answered with
//! one JSON event per line.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use relgate_core::{
    BackendError, ListFilter, ResourceBackend, ResourceKey, ResourceKind, WatchEvent, WatchStream,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

pub struct KubeClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl KubeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            timeout,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.client.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        request
    }

    /// Send with the per-call timeout and map transport and status failures.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, BackendError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{what}: {e}")))?;
        check_status(response, what).await
    }

    async fn json(&self, request: RequestBuilder, what: &str) -> Result<Value, BackendError> {
        self.send(request, what)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{what}: undecodable response: {e}")))
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    // prefer the Status object's message when the backend sends one
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or(body);
    debug!(what, status = status.as_u16(), message = %message, "Backend rejected request");
    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        return Err(BackendError::Unavailable(format!("{what}: {status}: {message}")));
    }
    Err(BackendError::Rejected { status: status.as_u16(), message })
}

/// REST path for a kind, optional namespace, and optional object name.
pub fn resource_path(kind: &ResourceKind, namespace: Option<&str>, name: Option<&str>) -> String {
    let mut path = if kind.group().is_empty() {
        format!("/api/{}", kind.version())
    } else {
        format!("/apis/{}", kind.group_version)
    };
    if let Some(ns) = namespace {
        path.push_str(&format!("/namespaces/{ns}"));
    }
    path.push('/');
    path.push_str(&kind.resource);
    if let Some(name) = name {
        path.push('/');
        path.push_str(name);
    }
    path
}

/// `fieldSelector` for a filter naming exactly one object. Larger name sets
/// are narrowed client-side once the response arrives.
fn field_selector(filter: &ListFilter) -> Option<String> {
    let names = filter.names.as_ref().filter(|n| n.len() == 1)?;
    let only = names.iter().next()?;
    let mut selector = format!("metadata.name={}", only.name);
    if let (Some(ns), None) = (&only.namespace, &filter.namespace) {
        selector.push_str(&format!(",metadata.namespace={ns}"));
    }
    Some(selector)
}

/// Add the filter's field selector, if any, to a list or watch request.
fn narrowed(request: RequestBuilder, filter: &ListFilter) -> RequestBuilder {
    match field_selector(filter) {
        Some(selector) => request.query(&[("fieldSelector", selector)]),
        None => request,
    }
}

fn key_path(key: &ResourceKey) -> String {
    resource_path(&key.kind, key.namespace.as_deref(), key.name.as_deref())
}

/// Split a byte stream into trimmed, non-empty lines, carrying partial lines
/// across chunks. A trailing line without a newline is emitted at end of stream.
fn lines<S, B>(chunks: S) -> impl futures::Stream<Item = Result<String, BackendError>>
where
    S: futures::Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    stream::unfold(Some((chunks, Vec::<u8>::new())), |state| async move {
        let (mut chunks, mut buf) = state?;
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Some((Ok(line), Some((chunks, buf))));
            }
            match chunks.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    let err = BackendError::Unavailable(format!("watch read: {e}"));
                    return Some((Err(err), None));
                }
                None => {
                    let rest = String::from_utf8_lossy(&buf).trim().to_string();
                    return (!rest.is_empty()).then(|| (Ok(rest), None));
                }
            }
        }
    })
}

#[async_trait]
impl ResourceBackend for KubeClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn get(&self, key: &ResourceKey) -> Result<Value, BackendError> {
        let path = key_path(key);
        self.json(self.request(Method::GET, &path), &path).await
    }

    async fn list(&self, kind: &ResourceKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
        let path = resource_path(kind, filter.namespace.as_deref(), None);
        let body = self.json(narrowed(self.request(Method::GET, &path), filter), &path).await?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items.into_iter().filter(|o| filter.admits(o)).collect())
    }

    async fn watch(&self, kind: &ResourceKind, filter: &ListFilter) -> Result<WatchStream, BackendError> {
        let path = resource_path(kind, filter.namespace.as_deref(), None);
        // no timeout: the stream lives as long as the client connection
        let response = narrowed(self.request(Method::GET, &path).query(&[("watch", "true")]), filter)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{path}: {e}")))?;
        let response = check_status(response, &path).await?;
        debug!(path = %path, "Backend watch opened");

        let filter = filter.clone();
        let events = lines(response.bytes_stream().boxed())
            .and_then(|line| async move {
                serde_json::from_str::<WatchEvent>(&line).map_err(|e| {
                    warn!(error = %e, "Undecodable watch event");
                    BackendError::Unavailable(format!("undecodable watch event: {e}"))
                })
            })
            .try_filter(move |event| futures::future::ready(filter.admits(&event.object)));
        Ok(events.boxed())
    }

    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value, BackendError> {
        let path = resource_path(&key.kind, key.namespace.as_deref(), None);
        self.json(self.request(Method::POST, &path).json(&object), &path).await
    }

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value, BackendError> {
        let path = key_path(key);
        self.json(self.request(Method::PUT, &path).json(&object), &path).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<Value, BackendError> {
        let path = key_path(key);
        // the API may answer with a Status object rather than the deleted
        // object, so keep a copy of the last state
        let last = self.get(key).await?;
        let deleted = self.json(self.request(Method::DELETE, &path), &path).await?;
        Ok(if deleted.get("metadata").is_some() && deleted.get("kind").and_then(Value::as_str) != Some("Status") {
            deleted
        } else {
            last
        })
    }
}
