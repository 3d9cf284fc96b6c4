//! Relationship tuples and the request/response shapes of the permission graph.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `(resourceType, resourceId, relation, subjectType, subjectId)` fact.
///
/// Written as `resourceType:resourceId#relation@subjectType:subjectId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipTuple {
    pub resource_type: String,
    pub resource_id: String,
    pub relation: String,
    pub subject_type: String,
    pub subject_id: String,
}

impl RelationshipTuple {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        relation: impl Into<String>,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            relation: relation.into(),
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
        }
    }

    pub fn subject(&self) -> SubjectRef {
        SubjectRef::new(self.subject_type.clone(), self.subject_id.clone())
    }
}

impl fmt::Display for RelationshipTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.resource_type, self.resource_id, self.relation, self.subject_type, self.subject_id
        )
    }
}

/// Error for a tuple string that does not have the five required parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed relationship '{0}': expected type:id#relation@subjectType:subjectId")]
pub struct TupleParseError(pub String);

/// Split `type:id#relation@subjectType:subjectId` into its five raw parts.
/// Parts may themselves contain placeholders; only the separators matter.
pub fn split_tuple(raw: &str) -> Result<[&str; 5], TupleParseError> {
    let err = || TupleParseError(raw.to_string());
    let (resource, subject) = raw.split_once('@').ok_or_else(err)?;
    let (object, relation) = resource.split_once('#').ok_or_else(err)?;
    let (resource_type, resource_id) = object.split_once(':').ok_or_else(err)?;
    let (subject_type, subject_id) = subject.split_once(':').ok_or_else(err)?;
    let parts = [resource_type, resource_id, relation, subject_type, subject_id];
    if parts.iter().any(|p| p.is_empty()) {
        return Err(err());
    }
    Ok(parts)
}

impl FromStr for RelationshipTuple {
    type Err = TupleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [rt, rid, rel, st, sid] = split_tuple(s.trim())?;
        Ok(Self::new(rt, rid, rel, st, sid))
    }
}

/// The subject half of a tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub subject_type: String,
    pub subject_id: String,
}

impl SubjectRef {
    pub fn new(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self { subject_type: subject_type.into(), subject_id: subject_id.into() }
    }
}

/// Outcome of a check. Missing tuples and explicit denials are the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permissionship {
    Allowed,
    Denied,
}

impl Permissionship {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Filter over stored relationships. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

impl RelationshipFilter {
    /// A filter that matches exactly one tuple.
    pub fn exact(tuple: &RelationshipTuple) -> Self {
        Self {
            resource_type: Some(tuple.resource_type.clone()),
            resource_id: Some(tuple.resource_id.clone()),
            relation: Some(tuple.relation.clone()),
            subject_type: Some(tuple.subject_type.clone()),
            subject_id: Some(tuple.subject_id.clone()),
        }
    }

    pub fn matches(&self, tuple: &RelationshipTuple) -> bool {
        fn ok(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        ok(&self.resource_type, &tuple.resource_type)
            && ok(&self.resource_id, &tuple.resource_id)
            && ok(&self.relation, &tuple.relation)
            && ok(&self.subject_type, &tuple.subject_type)
            && ok(&self.subject_id, &tuple.subject_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreconditionKind {
    MustExist,
    MustNotExist,
}

/// A tuple-existence assertion that must hold for a write to be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Precondition {
    pub kind: PreconditionKind,
    pub filter: RelationshipFilter,
}

impl Precondition {
    pub fn must_exist(tuple: &RelationshipTuple) -> Self {
        Self { kind: PreconditionKind::MustExist, filter: RelationshipFilter::exact(tuple) }
    }

    pub fn must_not_exist(tuple: &RelationshipTuple) -> Self {
        Self { kind: PreconditionKind::MustNotExist, filter: RelationshipFilter::exact(tuple) }
    }

    /// Whether the precondition holds given whether a matching tuple exists.
    pub fn holds(&self, exists: bool) -> bool {
        match self.kind {
            PreconditionKind::MustExist => exists,
            PreconditionKind::MustNotExist => !exists,
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let f_ = &self.filter;
        let part = |v: &Option<String>| v.clone().unwrap_or_else(|| "*".into());
        let verb = match self.kind {
            PreconditionKind::MustExist => "exists",
            PreconditionKind::MustNotExist => "absent",
        };
        write!(
            f,
            "{verb}({}:{}#{}@{}:{})",
            part(&f_.resource_type),
            part(&f_.resource_id),
            part(&f_.relation),
            part(&f_.subject_type),
            part(&f_.subject_id)
        )
    }
}

/// One atomic write: all preconditions are verified before any tuple changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipWrite {
    pub creates: Vec<RelationshipTuple>,
    pub deletes: Vec<RelationshipTuple>,
    pub preconditions: Vec<Precondition>,
}

impl RelationshipWrite {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum WriteOutcome {
    Committed { revision: String },
    PreconditionFailed { precondition: Precondition },
}
