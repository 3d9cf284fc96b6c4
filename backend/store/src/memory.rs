//! In-process resource store with watch support.
//!
//! Objects live in per-kind maps ordered by (namespace, name), which is also
//! the list order. Every mutation is broadcast to open watches. One-shot
//! failures can be queued per operation for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use relgate_core::{
    BackendError, ListFilter, ObjectName, ResourceBackend, ResourceKey, ResourceKind, WatchEvent,
    WatchEventType, WatchStream,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const WATCH_BUFFER: usize = 256;

/// Operations that can have a failure queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Watch,
    Create,
    Update,
    Delete,
}

type Collection = BTreeMap<ObjectName, Value>;

pub struct MemoryStore {
    objects: RwLock<HashMap<ResourceKind, Collection>>,
    events: broadcast::Sender<(ResourceKind, WatchEvent)>,
    version: AtomicU64,
    failures: Mutex<HashMap<Operation, BackendError>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
            version: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Seed from config: keys are `groupVersion/resource`.
    pub fn from_config(seed: &BTreeMap<String, Vec<Value>>) -> anyhow::Result<Self> {
        let store = Self::new();
        let mut objects = HashMap::new();
        for (key, items) in seed {
            let (gv, resource) = key
                .rsplit_once('/')
                .ok_or_else(|| anyhow::anyhow!("seed key '{key}' is not groupVersion/resource"))?;
            let collection: &mut Collection = objects.entry(ResourceKind::new(gv, resource)).or_default();
            for item in items {
                let name = ObjectName::from_object(item)
                    .ok_or_else(|| anyhow::anyhow!("seed object under '{key}' has no metadata.name"))?;
                let mut item = item.clone();
                store.stamp(&mut item);
                collection.insert(name, item);
            }
        }
        Ok(Self { objects: RwLock::new(objects), ..store })
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: Operation, error: BackendError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, error);
        }
    }

    fn take_failure(&self, op: Operation) -> Result<(), BackendError> {
        let queued = self.failures.lock().ok().and_then(|mut f| f.remove(&op));
        match queued {
            Some(err) => {
                debug!(op = ?op, error = %err, "Injected backend failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Insert or replace an object directly, notifying watches.
    pub async fn put(&self, kind: &ResourceKind, object: Value) -> Option<Value> {
        let name = ObjectName::from_object(&object)?;
        let mut object = object;
        self.stamp(&mut object);
        let existed = self
            .objects
            .write()
            .await
            .entry(kind.clone())
            .or_default()
            .insert(name, object.clone())
            .is_some();
        let event_type = if existed { WatchEventType::Modified } else { WatchEventType::Added };
        self.publish(kind, event_type, &object);
        Some(object)
    }

    pub async fn count(&self, kind: &ResourceKind) -> usize {
        self.objects.read().await.get(kind).map_or(0, |c| c.len())
    }

    fn stamp(&self, object: &mut Value) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".into(), json!(version.to_string()));
        }
    }

    fn publish(&self, kind: &ResourceKind, event_type: WatchEventType, object: &Value) {
        // no receivers is fine
        let _ = self.events.send((kind.clone(), WatchEvent::new(event_type, object.clone())));
    }

    /// Fill in namespace and name on an object being created.
    fn prepare_new(&self, key: &ResourceKey, mut object: Value) -> Result<(ObjectName, Value), BackendError> {
        if !object.is_object() {
            return Err(BackendError::Rejected { status: 400, message: "object must be a JSON object".into() });
        }
        let meta = object
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| json!({})))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| BackendError::Rejected { status: 400, message: "metadata must be an object".into() })?;

        if let Some(ns) = &key.namespace {
            let given = meta.get("namespace").and_then(Value::as_str).map(str::to_string);
            match given {
                Some(given) if &given != ns => {
                    return Err(BackendError::Rejected {
                        status: 400,
                        message: format!("namespace '{given}' does not match request namespace '{ns}'"),
                    })
                }
                _ => {
                    meta.insert("namespace".into(), json!(ns));
                }
            }
        }
        let has_name = meta.get("name").and_then(Value::as_str).is_some_and(|n| !n.is_empty());
        if !has_name {
            let name = match (&key.name, meta.get("generateName").and_then(Value::as_str)) {
                (Some(name), _) => name.clone(),
                (None, Some(prefix)) => format!("{prefix}{}", self.suffix()),
                (None, None) => {
                    return Err(BackendError::Rejected {
                        status: 422,
                        message: "metadata.name or metadata.generateName is required".into(),
                    })
                }
            };
            meta.insert("name".into(), json!(name));
        }
        let name = ObjectName::from_object(&object)
            .ok_or_else(|| BackendError::Rejected { status: 422, message: "invalid metadata".into() })?;
        Ok((name, object))
    }

    /// Five characters derived from the version counter.
    fn suffix(&self) -> String {
        const ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
        let mut n = self.version.load(Ordering::SeqCst).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ 0x5bd1_e995;
        (0..5)
            .map(|_| {
                let c = ALPHABET[(n % ALPHABET.len() as u64) as usize] as char;
                n /= ALPHABET.len() as u64;
                c
            })
            .collect()
    }
}

fn object_key(key: &ResourceKey) -> Result<ObjectName, BackendError> {
    key.object_name()
        .ok_or_else(|| BackendError::Rejected { status: 400, message: "object name is required".into() })
}

#[async_trait]
impl ResourceBackend for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &ResourceKey) -> Result<Value, BackendError> {
        self.take_failure(Operation::Get)?;
        let name = object_key(key)?;
        self.objects
            .read()
            .await
            .get(&key.kind)
            .and_then(|c| c.get(&name))
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("{} {}", key.kind.resource, name.resource_id())))
    }

    async fn list(&self, kind: &ResourceKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError> {
        self.take_failure(Operation::List)?;
        let objects = self.objects.read().await;
        Ok(objects
            .get(kind)
            .map(|c| c.values().filter(|o| filter.admits(o)).cloned().collect())
            .unwrap_or_default())
    }

    async fn watch(&self, kind: &ResourceKind, filter: &ListFilter) -> Result<WatchStream, BackendError> {
        self.take_failure(Operation::Watch)?;
        // subscribe before snapshotting so no mutation falls between the two
        let live = BroadcastStream::new(self.events.subscribe());
        let initial: Vec<Result<WatchEvent, BackendError>> = self
            .objects
            .read()
            .await
            .get(kind)
            .map(|c| {
                c.values()
                    .filter(|o| filter.admits(o))
                    .map(|o| Ok(WatchEvent::new(WatchEventType::Added, o.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let kind = kind.clone();
        let filter = filter.clone();
        let live = live.filter_map(move |item| {
            let out = match item {
                Ok((k, event)) if k == kind && filter.admits(&event.object) => Some(Ok(event)),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Memory watch lagged");
                    Some(Err(BackendError::Unavailable(format!("watch lagged: {e}"))))
                }
            };
            futures::future::ready(out)
        });
        Ok(stream::iter(initial).chain(live).boxed())
    }

    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value, BackendError> {
        self.take_failure(Operation::Create)?;
        let (name, mut object) = self.prepare_new(key, object)?;
        let mut objects = self.objects.write().await;
        let collection = objects.entry(key.kind.clone()).or_default();
        if collection.contains_key(&name) {
            return Err(BackendError::already_exists(format!("{} {}", key.kind.resource, name.resource_id())));
        }
        self.stamp(&mut object);
        collection.insert(name, object.clone());
        self.publish(&key.kind, WatchEventType::Added, &object);
        Ok(object)
    }

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value, BackendError> {
        self.take_failure(Operation::Update)?;
        let name = object_key(key)?;
        if ObjectName::from_object(&object).is_some_and(|n| n.name != name.name) {
            return Err(BackendError::Rejected { status: 400, message: "object name does not match the request".into() });
        }
        let mut objects = self.objects.write().await;
        let slot = objects
            .get_mut(&key.kind)
            .and_then(|c| c.get_mut(&name))
            .ok_or_else(|| BackendError::not_found(format!("{} {}", key.kind.resource, name.resource_id())))?;
        let mut object = object;
        if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("name".into(), json!(name.name));
            if let Some(ns) = &name.namespace {
                meta.insert("namespace".into(), json!(ns));
            }
        }
        self.stamp(&mut object);
        *slot = object.clone();
        self.publish(&key.kind, WatchEventType::Modified, &object);
        Ok(object)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<Value, BackendError> {
        self.take_failure(Operation::Delete)?;
        let name = object_key(key)?;
        let removed = self
            .objects
            .write()
            .await
            .get_mut(&key.kind)
            .and_then(|c| c.remove(&name))
            .ok_or_else(|| BackendError::not_found(format!("{} {}", key.kind.resource, name.resource_id())))?;
        self.publish(&key.kind, WatchEventType::Deleted, &removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn pods() -> ResourceKind {
        ResourceKind::new("v1", "pods")
    }

    fn pod(ns: &str, name: &str) -> Value {
        json!({"metadata": {"name": name, "namespace": ns}})
    }

    #[tokio::test]
    async fn create_get_delete() {
        let store = MemoryStore::new();
        let key = ResourceKey::object(pods(), Some("a".into()), "web");
        let created = store.create(&ResourceKey::collection(pods(), Some("a".into())), pod("a", "web")).await.unwrap();
        assert_eq!(created["metadata"]["resourceVersion"], "1");
        assert_eq!(store.get(&key).await.unwrap()["metadata"]["name"], "web");

        let dup = store.create(&ResourceKey::collection(pods(), Some("a".into())), pod("a", "web")).await;
        assert!(matches!(dup, Err(BackendError::Rejected { status: 409, .. })));

        store.delete(&key).await.unwrap();
        assert!(matches!(store.get(&key).await, Err(BackendError::Rejected { status: 404, .. })));
    }

    #[tokio::test]
    async fn generate_name_assigns_a_name() {
        let store = MemoryStore::new();
        let created = store
            .create(
                &ResourceKey::collection(pods(), Some("a".into())),
                json!({"metadata": {"generateName": "web-"}}),
            )
            .await
            .unwrap();
        let name = created["metadata"]["name"].as_str().unwrap();
        assert!(name.starts_with("web-") && name.len() == 9, "{name}");
        assert_eq!(created["metadata"]["namespace"], "a");
    }

    #[tokio::test]
    async fn list_applies_name_filter_in_order() {
        let store = MemoryStore::new();
        for n in ["c", "a", "b"] {
            store.put(&pods(), pod("x", n)).await;
        }
        let names: BTreeSet<_> =
            ["a", "c"].iter().map(|n| ObjectName::new(Some("x".into()), *n)).collect();
        let listed = store
            .list(&pods(), &ListFilter { namespace: None, names: Some(names) })
            .await
            .unwrap();
        let got: Vec<_> = listed.iter().map(|o| o["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(got, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn watch_replays_then_follows() {
        let store = MemoryStore::new();
        store.put(&pods(), pod("x", "a")).await;
        let mut watch = store.watch(&pods(), &ListFilter::default()).await.unwrap();
        store.put(&ResourceKind::new("v1", "secrets"), pod("x", "s")).await;
        store.put(&pods(), pod("x", "b")).await;
        store.delete(&ResourceKey::object(pods(), Some("x".into()), "a")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let ev = watch.next().await.unwrap().unwrap();
            seen.push((ev.event_type, ev.object["metadata"]["name"].as_str().unwrap().to_string()));
        }
        assert_eq!(
            seen,
            vec![
                (WatchEventType::Added, "a".to_string()),
                (WatchEventType::Added, "b".to_string()),
                (WatchEventType::Deleted, "a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn injected_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Create, BackendError::already_exists("pods nginx"));
        let key = ResourceKey::collection(pods(), Some("a".into()));
        assert!(store.create(&key, pod("a", "nginx")).await.is_err());
        assert_eq!(store.count(&pods()).await, 0);
        assert!(store.create(&key, pod("a", "nginx")).await.is_ok());
    }

    #[tokio::test]
    async fn seeds_from_config() {
        let mut seed = BTreeMap::new();
        seed.insert("v1/namespaces".to_string(), vec![json!({"metadata": {"name": "a"}})]);
        let store = MemoryStore::from_config(&seed).unwrap();
        assert_eq!(store.count(&ResourceKind::new("v1", "namespaces")).await, 1);

        seed.insert("bad".to_string(), vec![]);
        assert!(MemoryStore::from_config(&seed).is_err());
    }
}
