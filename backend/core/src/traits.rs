use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BackendError, GraphError};
use crate::tuple::{
    Permissionship, RelationshipFilter, RelationshipTuple, RelationshipWrite, SubjectRef,
    WriteOutcome,
};
use crate::types::{ObjectName, ResourceKey, ResourceKind};

/// Client for the relationship-based permission graph.
#[async_trait]
pub trait PermissionGraph: Send + Sync {
    /// Backend name for logging (e.g. "spicedb", "embedded").
    fn name(&self) -> &str;

    /// Does `subject` hold `relation` (a relation or permission) on the resource?
    async fn check(&self, tuple: &RelationshipTuple) -> Result<Permissionship, GraphError>;

    /// Ids of `resource_type` objects on which `subject` holds `permission`,
    /// in the order the graph returns them.
    async fn lookup_resources(
        &self,
        resource_type: &str,
        permission: &str,
        subject: &SubjectRef,
        limit: Option<usize>,
    ) -> Result<Vec<String>, GraphError>;

    /// Apply creates and deletes atomically, guarded by the preconditions.
    async fn write_relationships(&self, write: &RelationshipWrite) -> Result<WriteOutcome, GraphError>;

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RelationshipTuple>, GraphError>;
}

/// Narrowing applied to list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub namespace: Option<String>,
    /// When set, only these objects are returned. An entry without a
    /// namespace matches that name in every namespace.
    pub names: Option<BTreeSet<ObjectName>>,
}

impl ListFilter {
    pub fn namespace(namespace: Option<String>) -> Self {
        Self { namespace, names: None }
    }

    pub fn admits(&self, object: &Value) -> bool {
        let Some(name) = ObjectName::from_object(object) else {
            return false;
        };
        if let Some(ns) = &self.namespace {
            if name.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        self.names.as_ref().map_or(true, |set| {
            set.contains(&name)
                || (name.namespace.is_some() && set.contains(&ObjectName::new(None, name.name.clone())))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

/// One change notification from a backend watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: Value,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, object: Value) -> Self {
        Self { event_type, object }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, BackendError>>;

/// Client for the typed-object backend resource store.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &ResourceKey) -> Result<Value, BackendError>;

    /// Snapshot of the collection, in backend order.
    async fn list(&self, kind: &ResourceKind, filter: &ListFilter) -> Result<Vec<Value>, BackendError>;

    /// Live event stream. Dropping the stream releases the subscription.
    async fn watch(&self, kind: &ResourceKind, filter: &ListFilter) -> Result<WatchStream, BackendError>;

    /// Create `object`; the returned object carries any generated name.
    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value, BackendError>;

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value, BackendError>;

    /// Delete the object and return its last state.
    async fn delete(&self, key: &ResourceKey) -> Result<Value, BackendError>;
}
