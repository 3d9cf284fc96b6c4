//! Config validation: structural checks with field paths.
//!
//! Rule templates and conditions are compiled (and rejected) by the rules
//! crate; this pass only covers what can be judged from the config alone.

use std::net::SocketAddr;

use thiserror::Error;

use crate::schema::{BackendKind, GraphKind, RelgateConfig, RuleSpec};

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// Errors and warnings found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError { path: path.into(), message: message.into() });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError { path: path.into(), message: message.into() });
    }
}

pub fn validate(config: &RelgateConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_server(config, &mut report);
    validate_graph(config, &mut report);
    validate_backend(config, &mut report);
    validate_policy(config, &mut report);
    validate_rules(config, &mut report);
    validate_object_fields(config, &mut report);
    validate_logging(config, &mut report);
    report
}

fn validate_server(config: &RelgateConfig, report: &mut ValidationReport) {
    if config.server.bind.parse::<SocketAddr>().is_err() {
        report.error("server.bind", format!("'{}' is not a socket address", config.server.bind));
    }
}

fn validate_graph(config: &RelgateConfig, report: &mut ValidationReport) {
    let graph = &config.graph;
    match graph.kind {
        GraphKind::Spicedb => {
            if graph.endpoint.as_deref().map_or(true, str::is_empty) {
                report.error("graph.endpoint", "SpiceDB endpoint is required");
            }
            if graph.token.is_none() {
                report.warn("graph.token", "No token configured; requests will be unauthenticated");
            }
            if !graph.schema.is_empty() || !graph.relationships.is_empty() {
                report.warn("graph.schema", "schema and relationships are only used by the embedded graph");
            }
        }
        GraphKind::Embedded => {
            for (i, rel) in graph.relationships.iter().enumerate() {
                if rel.parse::<relationship::Tuple>().is_err() {
                    report.error(format!("graph.relationships[{i}]"), format!("malformed relationship '{rel}'"));
                }
            }
        }
    }
    if graph.timeout_ms == 0 {
        report.error("graph.timeoutMs", "timeoutMs must be > 0");
    }
    if graph.read_retry.max_attempts == 0 {
        report.error("graph.readRetry.maxAttempts", "maxAttempts must be >= 1");
    }
    if graph.read_retry.backoff_factor < 1.0 {
        report.error("graph.readRetry.backoffFactor", "backoffFactor must be >= 1.0");
    }
    if graph.lookup_limit == 0 {
        report.error("graph.lookupLimit", "lookupLimit must be >= 1");
    }
}

fn validate_backend(config: &RelgateConfig, report: &mut ValidationReport) {
    let backend = &config.backend;
    match backend.kind {
        BackendKind::Http => {
            if backend.endpoint.as_deref().map_or(true, str::is_empty) {
                report.error("backend.endpoint", "Backend endpoint is required");
            }
        }
        BackendKind::Memory => {
            for key in backend.objects.keys() {
                if key.rsplit_once('/').is_none() {
                    report.error(
                        format!("backend.objects.{key}"),
                        "keys must be 'groupVersion/resource', e.g. 'v1/pods'",
                    );
                }
            }
        }
    }
    if backend.timeout_ms == 0 {
        report.error("backend.timeoutMs", "timeoutMs must be > 0");
    }
}

fn validate_policy(config: &RelgateConfig, report: &mut ValidationReport) {
    if config.policy.allow_unmatched {
        report.warn(
            "policy.allowUnmatched",
            "Requests no rule covers will be forwarded without authorization",
        );
    }
}

fn validate_rules(config: &RelgateConfig, report: &mut ValidationReport) {
    let rules = &config.rules;
    if rules.path.is_none() && rules.inline.is_empty() {
        report.warn("rules", "No rules configured; every request will be denied");
    }
    if rules.watch && rules.path.is_none() {
        report.error("rules.watch", "watch requires rules.path");
    }
    for (i, rule) in rules.inline.iter().enumerate() {
        validate_rule(rule, &format!("rules.inline[{i}]"), report);
    }
}

/// Shape checks for one rule; shared with rule files loaded later.
pub fn validate_rule(rule: &RuleSpec, path: &str, report: &mut ValidationReport) {
    if rule.matches.as_slice().is_empty() {
        report.error(format!("{path}.match"), "at least one match is required");
    }
    for (j, m) in rule.matches.as_slice().iter().enumerate() {
        let mpath = format!("{path}.match[{j}]");
        if m.group_version.trim().is_empty() {
            report.error(format!("{mpath}.groupVersion"), "groupVersion cannot be empty");
        }
        if m.resource.trim().is_empty() {
            report.error(format!("{mpath}.resource"), "resource cannot be empty");
        }
        if m.verbs.is_empty() {
            report.error(format!("{mpath}.verbs"), "at least one verb is required");
        }
    }
    let has_effect = !rule.checks.is_empty()
        || !rule.pre_filter.as_slice().is_empty()
        || !rule.post_filter.as_slice().is_empty()
        || rule.update.is_some();
    if !has_effect {
        report.warn(path.to_string(), "rule has no checks, filters, or updates; matching requests are allowed");
    }
}

fn validate_object_fields(config: &RelgateConfig, report: &mut ValidationReport) {
    for (i, field) in config.object_fields.iter().enumerate() {
        if field.trim().is_empty() || field.split('.').any(str::is_empty) {
            report.error(format!("objectFields[{i}]"), format!("'{field}' is not a dotted path"));
        }
    }
}

fn validate_logging(config: &RelgateConfig, report: &mut ValidationReport) {
    let level = config.logging.level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") && !level.contains('=') {
        report.warn("logging.level", format!("Unrecognised level '{}'", config.logging.level));
    }
}

/// Minimal tuple shape check without depending on the core crate.
mod relationship {
    use std::str::FromStr;

    pub struct Tuple;

    impl FromStr for Tuple {
        type Err = ();

        fn from_str(s: &str) -> Result<Self, ()> {
            let (resource, subject) = s.split_once('@').ok_or(())?;
            let (object, relation) = resource.split_once('#').ok_or(())?;
            let (rt, rid) = object.split_once(':').ok_or(())?;
            let (st, sid) = subject.split_once(':').ok_or(())?;
            if [rt, rid, relation, st, sid].iter().any(|p| p.trim().is_empty()) {
                return Err(());
            }
            Ok(Tuple)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MatchSpec, OneOrMany};

    #[test]
    fn default_config_is_valid() {
        let report = validate(&RelgateConfig::default());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.path == "rules"));
    }

    #[test]
    fn spicedb_requires_endpoint() {
        let mut cfg = RelgateConfig::default();
        cfg.graph.kind = GraphKind::Spicedb;
        let report = validate(&cfg);
        assert!(report.errors.iter().any(|e| e.path == "graph.endpoint"));
    }

    #[test]
    fn bad_bootstrap_relationship_is_error() {
        let mut cfg = RelgateConfig::default();
        cfg.graph.relationships = vec!["namespace:a#viewer@user:bob".into(), "namespace:a#viewer".into()];
        let report = validate(&cfg);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, "graph.relationships[1]");
    }

    #[test]
    fn rule_without_verbs_is_error() {
        let mut cfg = RelgateConfig::default();
        cfg.rules.inline.push(RuleSpec {
            name: None,
            matches: OneOrMany::One(MatchSpec {
                group_version: "v1".into(),
                resource: "pods".into(),
                verbs: vec![],
            }),
            condition: None,
            checks: vec!["pod:{{name}}#view@user:{{user.name}}".into()],
            pre_filter: OneOrMany::default(),
            post_filter: OneOrMany::default(),
            update: None,
        });
        let report = validate(&cfg);
        assert!(report.errors.iter().any(|e| e.path == "rules.inline[0].match[0].verbs"));
    }

    #[test]
    fn watch_without_path_is_error() {
        let mut cfg = RelgateConfig::default();
        cfg.rules.watch = true;
        assert!(!validate(&cfg).is_valid());
    }
}
