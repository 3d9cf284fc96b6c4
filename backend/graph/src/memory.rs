//! Embedded, in-process permission graph.
//!
//! Holds tuples in memory and resolves permissions from a small schema:
//! `type → permission → [relation | relation->permission]`. A name that is not
//! a permission of its type is a plain relation and only grants itself.
//! Used for single-process deployments and as the test double, with switches
//! for injecting failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use relgate_core::{
    GraphError, Permissionship, PermissionGraph, RelationshipFilter, RelationshipTuple,
    RelationshipWrite, SubjectRef, WriteOutcome,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// type → permission → the relations (or `relation->permission` arrows) that grant it.
pub type Schema = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Arrow and permission nesting allowed before a check gives up.
const MAX_DEPTH: usize = 16;

/// Schema used when none is configured: namespaces and pods, viewable by
/// viewers and creators, editable by creators.
pub fn bootstrap_schema() -> Schema {
    let perms = |pairs: &[(&str, &[&str])]| -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(p, rels)| (p.to_string(), rels.iter().map(|r| r.to_string()).collect()))
            .collect()
    };
    let mut schema = Schema::new();
    schema.insert(
        "namespace".into(),
        perms(&[
            ("admin", &["creator"]),
            ("edit", &["creator"]),
            ("view", &["viewer", "creator"]),
        ]),
    );
    schema.insert(
        "pod".into(),
        perms(&[("edit", &["creator"]), ("view", &["viewer", "creator"])]),
    );
    schema
}

pub struct MemoryGraph {
    schema: Schema,
    tuples: RwLock<BTreeSet<RelationshipTuple>>,
    revision: AtomicU64,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new(bootstrap_schema())
    }
}

impl MemoryGraph {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            tuples: RwLock::new(BTreeSet::new()),
            revision: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Build from config: an empty schema falls back to [`bootstrap_schema`].
    pub fn from_config(schema: &Schema, relationships: &[String]) -> Result<Self, GraphError> {
        let schema = if schema.is_empty() { bootstrap_schema() } else { schema.clone() };
        let mut seeded = BTreeSet::new();
        for raw in relationships {
            let tuple = raw
                .parse::<RelationshipTuple>()
                .map_err(|e| GraphError::Rejected(e.to_string()))?;
            seeded.insert(tuple);
        }
        info!(types = schema.len(), relationships = seeded.len(), "Embedded graph bootstrapped");
        let graph = Self { tuples: RwLock::new(seeded), ..Self::new(schema) };
        Ok(graph)
    }

    /// Every call fails with [`GraphError::Unavailable`] while set.
    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::SeqCst);
    }

    /// Writes fail with [`GraphError::Unavailable`] while set; reads still work.
    pub fn set_fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub async fn insert(&self, tuple: RelationshipTuple) {
        self.tuples.write().await.insert(tuple);
    }

    pub async fn len(&self) -> usize {
        self.tuples.read().await.len()
    }

    pub async fn contains(&self, tuple: &RelationshipTuple) -> bool {
        self.tuples.read().await.contains(tuple)
    }

    fn ensure_available(&self) -> Result<(), GraphError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable("embedded graph marked unavailable".into()));
        }
        Ok(())
    }

    fn permitted(
        &self,
        tuples: &BTreeSet<RelationshipTuple>,
        resource_type: &str,
        resource_id: &str,
        permission: &str,
        subject: &SubjectRef,
        depth: usize,
    ) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        let grants = self
            .schema
            .get(resource_type)
            .and_then(|perms| perms.get(permission));
        let Some(grants) = grants else {
            return has_direct(tuples, resource_type, resource_id, permission, subject);
        };
        grants.iter().any(|grant| match grant.split_once("->") {
            Some((relation, target)) => related(tuples, resource_type, resource_id, relation)
                .any(|(st, sid)| self.permitted(tuples, st, sid, target, subject, depth + 1)),
            None if grant == permission => {
                has_direct(tuples, resource_type, resource_id, grant, subject)
            }
            None => self.permitted(tuples, resource_type, resource_id, grant, subject, depth + 1),
        })
    }
}

fn has_direct(
    tuples: &BTreeSet<RelationshipTuple>,
    resource_type: &str,
    resource_id: &str,
    relation: &str,
    subject: &SubjectRef,
) -> bool {
    tuples.contains(&RelationshipTuple::new(
        resource_type,
        resource_id,
        relation,
        subject.subject_type.as_str(),
        subject.subject_id.as_str(),
    ))
}

/// Subjects that `resource#relation` points at.
fn related<'a>(
    tuples: &'a BTreeSet<RelationshipTuple>,
    resource_type: &'a str,
    resource_id: &'a str,
    relation: &'a str,
) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    tuples
        .iter()
        .filter(move |t| {
            t.resource_type == resource_type && t.resource_id == resource_id && t.relation == relation
        })
        .map(|t| (t.subject_type.as_str(), t.subject_id.as_str()))
}

#[async_trait]
impl PermissionGraph for MemoryGraph {
    fn name(&self) -> &str {
        "embedded"
    }

    async fn check(&self, tuple: &RelationshipTuple) -> Result<Permissionship, GraphError> {
        self.ensure_available()?;
        let tuples = self.tuples.read().await;
        let allowed = self.permitted(
            &tuples,
            &tuple.resource_type,
            &tuple.resource_id,
            &tuple.relation,
            &tuple.subject(),
            0,
        );
        debug!(tuple = %tuple, allowed, "Embedded check");
        Ok(if allowed { Permissionship::Allowed } else { Permissionship::Denied })
    }

    async fn lookup_resources(
        &self,
        resource_type: &str,
        permission: &str,
        subject: &SubjectRef,
        limit: Option<usize>,
    ) -> Result<Vec<String>, GraphError> {
        self.ensure_available()?;
        let tuples = self.tuples.read().await;
        let candidates: BTreeSet<&str> = tuples
            .iter()
            .filter(|t| t.resource_type == resource_type)
            .map(|t| t.resource_id.as_str())
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|id| self.permitted(&tuples, resource_type, id, permission, subject, 0))
            .take(limit.unwrap_or(usize::MAX))
            .map(String::from)
            .collect())
    }

    async fn write_relationships(&self, write: &RelationshipWrite) -> Result<WriteOutcome, GraphError> {
        self.ensure_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable("embedded graph rejecting writes".into()));
        }
        let mut tuples = self.tuples.write().await;
        for precondition in &write.preconditions {
            let exists = tuples.iter().any(|t| precondition.filter.matches(t));
            if !precondition.holds(exists) {
                debug!(precondition = %precondition, "Embedded write precondition failed");
                return Ok(WriteOutcome::PreconditionFailed { precondition: precondition.clone() });
            }
        }
        for tuple in &write.deletes {
            tuples.remove(tuple);
        }
        for tuple in &write.creates {
            tuples.insert(tuple.clone());
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            creates = write.creates.len(),
            deletes = write.deletes.len(),
            revision,
            "Embedded write committed"
        );
        Ok(WriteOutcome::Committed { revision: revision.to_string() })
    }

    async fn read_relationships(
        &self,
        filter: &RelationshipFilter,
        limit: Option<usize>,
    ) -> Result<Vec<RelationshipTuple>, GraphError> {
        self.ensure_available()?;
        let tuples = self.tuples.read().await;
        Ok(tuples
            .iter()
            .filter(|t| filter.matches(t))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
