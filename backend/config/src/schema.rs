//! relgate configuration schema, typed for serde YAML/JSON deserialization.
//!
//! Every section is optional; missing sections take the values from
//! [`crate::defaults`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::defaults;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelgateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Permission graph connection
    #[serde(default)]
    pub graph: GraphConfig,

    /// Backend resource store connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Decision policy for requests no rule covers
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Where rules come from
    #[serde(default)]
    pub rules: RulesConfig,

    /// Object field paths (e.g. `metadata.labels.team`) exposed to rules as `object.<path>`
    #[serde(default)]
    pub object_fields: Vec<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "defaults::bind")]
    pub bind: String,
    /// Seconds to wait for in-flight requests on shutdown
    #[serde(default = "defaults::shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: defaults::bind(), shutdown_grace_secs: defaults::shutdown_grace_secs() }
    }
}

// ---------------------------------------------------------------------------
// Permission graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphKind {
    /// Remote SpiceDB HTTP gateway
    Spicedb,
    /// In-process graph bootstrapped from `schema` and `relationships`
    #[default]
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConfig {
    #[serde(default)]
    pub kind: GraphKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    /// Retry policy for idempotent reads (check, lookup, read). Writes never retry.
    #[serde(default)]
    pub read_retry: RetryConfig,
    /// Cap on the number of ids a single lookup may return
    #[serde(default = "defaults::lookup_limit")]
    pub lookup_limit: usize,
    /// Embedded schema: resource type → permission → relations that grant it.
    /// A relation not listed here only grants itself.
    #[serde(default)]
    pub schema: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Bootstrap tuples for the embedded graph (`type:id#rel@stype:sid`)
    #[serde(default)]
    pub relationships: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            kind: GraphKind::default(),
            endpoint: None,
            token: None,
            timeout_ms: defaults::timeout_ms(),
            read_retry: RetryConfig::default(),
            lookup_limit: defaults::lookup_limit(),
            schema: BTreeMap::new(),
            relationships: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "defaults::retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "defaults::retry_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::retry_max_attempts(),
            base_delay_ms: defaults::retry_base_delay_ms(),
            backoff_factor: defaults::retry_backoff_factor(),
            max_delay_ms: defaults::retry_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kubernetes-style REST API
    Http,
    /// In-process store, seeded from `objects`
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    /// Seed objects for the memory store, keyed by `groupVersion/resource`
    #[serde(default)]
    pub objects: BTreeMap<String, Vec<serde_json::Value>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: None,
            token: None,
            timeout_ms: defaults::timeout_ms(),
            objects: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Forward requests no rule covers. Off unless set explicitly.
    #[serde(default)]
    pub allow_unmatched: bool,
    /// Groups allowed to write relationships through the admin endpoint
    #[serde(default)]
    pub admin_groups: Vec<String>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesConfig {
    /// YAML file holding a list of rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub inline: Vec<RuleSpec>,
    /// Reload the rules file when it changes
    #[serde(default)]
    pub watch: bool,
}

/// A value that may be written as a single item or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(item) => std::slice::from_ref(item),
            Self::Many(items) => items,
        }
    }
}

/// One declarative authorization rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "match")]
    pub matches: OneOrMany<MatchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Relationship templates that must all resolve ALLOWED
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub pre_filter: OneOrMany<PreFilterSpec>,
    #[serde(default)]
    pub post_filter: OneOrMany<PostFilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSpec {
    pub group_version: String,
    pub resource: String,
    pub verbs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreFilterSpec {
    /// Maps a looked-up id to an object name, e.g. `{{resourceId.name}}`
    #[serde(rename = "fromObjectIDNameExpr", alias = "fromObjectIdNameExpr")]
    pub from_object_id_name_expr: String,
    #[serde(
        default,
        rename = "fromObjectIDNamespaceExpr",
        alias = "fromObjectIdNamespaceExpr",
        skip_serializing_if = "Option::is_none"
    )]
    pub from_object_id_namespace_expr: Option<String>,
    /// Lookup template with `$` as the resource id
    pub lookup_matching_resources: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostFilterSpec {
    pub check_permission_template: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSpec {
    #[serde(default)]
    pub create_relationships: Vec<String>,
    #[serde(default)]
    pub delete_relationships: Vec<String>,
    #[serde(default)]
    pub precondition_exists: Vec<String>,
    #[serde(default)]
    pub precondition_does_not_exist: Vec<String>,
}

// ---------------------------------------------------------------------------
// Logging / diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
    /// Directory for the rolling NDJSON log; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: defaults::log_level(), dir: None, json: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsConfig {
    /// Period of the relationship snapshot log; 0 disables it
    #[serde(default)]
    pub snapshot_interval_secs: u64,
    #[serde(default = "defaults::snapshot_limit")]
    pub snapshot_limit: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self { snapshot_interval_secs: 0, snapshot_limit: defaults::snapshot_limit() }
    }
}
