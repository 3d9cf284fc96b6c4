use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The API verbs the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 7] = [
        Verb::Get,
        Verb::List,
        Verb::Watch,
        Verb::Create,
        Verb::Update,
        Verb::Patch,
        Verb::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }

    /// True for verbs that change backend state.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Patch | Self::Delete)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .iter()
            .find(|v| v.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown verb '{s}'"))
    }
}

/// Authenticated caller identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub uid: String,
}

impl UserInfo {
    pub fn new(name: impl Into<String>, groups: Vec<String>) -> Self {
        let name = sanitize_user_name(&name.into());
        Self { uid: name.clone(), name, groups }
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Reduce `system:serviceaccount:<ns>:<name>` to `<name>` so the result is a
/// valid graph object id. Other names pass through untouched.
pub fn sanitize_user_name(user: &str) -> String {
    if let Some(rest) = user.strip_prefix("system:serviceaccount:") {
        if let Some(name) = rest.split(':').nth(1).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
    }
    user.to_string()
}

/// (group/version, resource) pair. The core group is written as just the version, e.g. `v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKind {
    pub group_version: String,
    pub resource: String,
}

impl ResourceKind {
    pub fn new(group_version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group_version: group_version.into(), resource: resource.into() }
    }

    /// Group part, empty for the core group.
    pub fn group(&self) -> &str {
        self.group_version
            .rsplit_once('/')
            .map(|(g, _)| g)
            .unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.group_version
            .rsplit_once('/')
            .map(|(_, v)| v)
            .unwrap_or(&self.group_version)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_version, self.resource)
    }
}

/// Namespace + name of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectName {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectName {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { namespace, name: name.into() }
    }

    /// Read `metadata.namespace` / `metadata.name` from a backend object.
    pub fn from_object(object: &serde_json::Value) -> Option<Self> {
        let meta = object.get("metadata")?;
        let name = meta.get("name")?.as_str()?.to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .map(String::from);
        Some(Self { namespace, name })
    }

    /// `namespace/name` for namespaced objects, `name` otherwise.
    pub fn resource_id(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Address of an object or collection in the backend store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl ResourceKey {
    pub fn collection(kind: ResourceKind, namespace: Option<String>) -> Self {
        Self { kind, namespace, name: None }
    }

    pub fn object(kind: ResourceKind, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace, name: Some(name.into()) }
    }

    pub fn object_name(&self) -> Option<ObjectName> {
        self.name
            .as_ref()
            .map(|n| ObjectName::new(self.namespace.clone(), n.clone()))
    }
}

/// A field of the request context that templates and conditions may reference.
///
/// The set is closed: anything else is rejected when rules are compiled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextField {
    Name,
    Namespace,
    ResourceId,
    Verb,
    Resource,
    GroupVersion,
    UserName,
    UserUid,
    UserGroups,
    /// `object.<path>`, a declared field extracted from the request body.
    Object(String),
}

impl ContextField {
    /// Parse a field reference. `object.*` paths must appear in `declared`.
    pub fn parse(raw: &str, declared: &[String]) -> Option<Self> {
        let field = match raw {
            "name" => Self::Name,
            "namespace" => Self::Namespace,
            "resourceId" => Self::ResourceId,
            "verb" => Self::Verb,
            "resource" => Self::Resource,
            "groupVersion" => Self::GroupVersion,
            "user.name" => Self::UserName,
            "user.uid" => Self::UserUid,
            "user.groups" => Self::UserGroups,
            other => {
                let path = other.strip_prefix("object.")?;
                if !declared.iter().any(|d| d == path) {
                    return None;
                }
                Self::Object(path.to_string())
            }
        };
        Some(field)
    }

    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Self::UserGroups)
    }
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name => f.write_str("name"),
            Self::Namespace => f.write_str("namespace"),
            Self::ResourceId => f.write_str("resourceId"),
            Self::Verb => f.write_str("verb"),
            Self::Resource => f.write_str("resource"),
            Self::GroupVersion => f.write_str("groupVersion"),
            Self::UserName => f.write_str("user.name"),
            Self::UserUid => f.write_str("user.uid"),
            Self::UserGroups => f.write_str("user.groups"),
            Self::Object(path) => write!(f, "object.{path}"),
        }
    }
}

/// Everything known about one inbound request. Built once, never mutated;
/// derived contexts (e.g. after the backend assigns a name) are new values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub verb: Verb,
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub user: UserInfo,
    /// Declared `object.*` fields, keyed by path.
    pub fields: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(verb: Verb, kind: ResourceKind, user: UserInfo) -> Self {
        Self {
            verb,
            kind,
            namespace: None,
            name: None,
            user,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|n| !n.is_empty());
        self
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.is_empty());
        self
    }

    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    /// Copy of this context re-pointed at a concrete object (e.g. one
    /// returned by the backend or an item of a list).
    pub fn for_object(&self, object: &ObjectName) -> Self {
        Self {
            namespace: object.namespace.clone(),
            name: Some(object.name.clone()),
            ..self.clone()
        }
    }

    pub fn object_name(&self) -> Option<ObjectName> {
        self.name
            .as_ref()
            .map(|n| ObjectName::new(self.namespace.clone(), n.clone()))
    }

    pub fn resource_id(&self) -> Option<String> {
        self.object_name().map(|o| o.resource_id())
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Values bound to `field`, or `None` if the field is absent.
    /// Single-valued fields yield exactly one value.
    pub fn resolve(&self, field: &ContextField) -> Option<Vec<String>> {
        let single = |v: Option<&String>| v.filter(|s| !s.is_empty()).map(|s| vec![s.clone()]);
        match field {
            ContextField::Name => single(self.name.as_ref()),
            ContextField::Namespace => single(self.namespace.as_ref()),
            ContextField::ResourceId => self.resource_id().map(|id| vec![id]),
            ContextField::Verb => Some(vec![self.verb.to_string()]),
            ContextField::Resource => Some(vec![self.kind.resource.clone()]),
            ContextField::GroupVersion => Some(vec![self.kind.group_version.clone()]),
            ContextField::UserName => single(Some(&self.user.name)),
            ContextField::UserUid => single(Some(&self.user.uid)),
            ContextField::UserGroups => {
                if self.user.groups.is_empty() {
                    None
                } else {
                    Some(self.user.groups.clone())
                }
            }
            ContextField::Object(path) => single(self.fields.get(path)),
        }
    }
}

/// Walk a dotted path (`metadata.labels.team`) into a JSON object and return
/// the scalar found there as a string.
pub fn extract_path(object: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = object;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    match current {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
