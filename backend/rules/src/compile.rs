//! Rule compilation: [`RuleSpec`] → [`CompiledRule`] → [`RuleTable`].
//!
//! Every problem in every rule is collected before failing, so one load
//! reports the whole set of mistakes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use relgate_config::{PreFilterSpec, RuleSpec};
use relgate_core::{ObjectName, ResourceKind, Verb};
use thiserror::Error;
use tracing::debug;

use crate::condition::Condition;
use crate::template::{IdTemplate, RelationshipTemplate};

// ---------------------------------------------------------------------------
// Compiled rule parts
// ---------------------------------------------------------------------------

/// Narrows list/watch queries through a bulk lookup.
#[derive(Debug, Clone)]
pub struct PreFilter {
    pub name_expr: IdTemplate,
    pub namespace_expr: Option<IdTemplate>,
    pub lookup: RelationshipTemplate,
}

impl PreFilter {
    /// Map one looked-up resource id to the backend object it names.
    pub fn object_for(&self, resource_id: &str) -> Option<ObjectName> {
        let name = self.name_expr.render(resource_id)?;
        let namespace = match &self.namespace_expr {
            Some(expr) => Some(expr.render(resource_id)?),
            None => None,
        };
        Some(ObjectName::new(namespace, name))
    }
}

/// Relationship side effects of a mutating request.
#[derive(Debug, Clone, Default)]
pub struct UpdateTemplates {
    pub creates: Vec<RelationshipTemplate>,
    pub deletes: Vec<RelationshipTemplate>,
    pub must_exist: Vec<RelationshipTemplate>,
    pub must_not_exist: Vec<RelationshipTemplate>,
}

impl UpdateTemplates {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.deletes.is_empty()
            && self.must_exist.is_empty()
            && self.must_not_exist.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub condition: Option<Condition>,
    pub checks: Vec<RelationshipTemplate>,
    pub pre_filters: Vec<PreFilter>,
    pub post_filters: Vec<RelationshipTemplate>,
    pub update: UpdateTemplates,
}

impl CompiledRule {
    /// Whether the optional condition admits `ctx`.
    pub fn applies(&self, ctx: &relgate_core::RequestContext) -> bool {
        self.condition.as_ref().map_or(true, |c| c.evaluate(ctx))
    }
}

// ---------------------------------------------------------------------------
// Load errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleProblem {
    pub rule: String,
    pub message: String,
}

impl fmt::Display for RuleProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule '{}': {}", self.rule, self.message)
    }
}

/// All problems found while compiling a rule set.
#[derive(Debug, Clone, Error)]
#[error("{} invalid rule(s): {}", .problems.len(), join(.problems))]
pub struct RuleLoadError {
    pub problems: Vec<RuleProblem>,
}

fn join(problems: &[RuleProblem]) -> String {
    problems.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum VerbSet {
    Any,
    Only(BTreeSet<Verb>),
}

impl VerbSet {
    fn contains(&self, verb: Verb) -> bool {
        match self {
            Self::Any => true,
            Self::Only(verbs) => verbs.contains(&verb),
        }
    }
}

#[derive(Debug, Clone)]
struct TableEntry {
    verbs: VerbSet,
    rule: Arc<CompiledRule>,
}

/// Immutable rule index keyed by (group/version, resource).
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    entries: HashMap<ResourceKind, Vec<TableEntry>>,
    rules: Vec<Arc<CompiledRule>>,
}

impl RuleTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile `specs`. `declared` lists the object field paths rules may use.
    pub fn compile(specs: &[RuleSpec], declared: &[String]) -> Result<Self, RuleLoadError> {
        let mut problems = Vec::new();
        let mut table = Self::default();

        for (i, spec) in specs.iter().enumerate() {
            let name = spec.name.clone().unwrap_or_else(|| format!("rule-{i}"));
            let mut report = |message: String| {
                problems.push(RuleProblem { rule: name.clone(), message });
            };

            let mut keys = Vec::new();
            if spec.matches.as_slice().is_empty() {
                report("at least one match is required".into());
            }
            for m in spec.matches.as_slice() {
                if m.group_version.trim().is_empty() || m.resource.trim().is_empty() {
                    report("match needs groupVersion and resource".into());
                    continue;
                }
                match parse_verbs(&m.verbs) {
                    Ok(verbs) => keys.push((ResourceKind::new(m.group_version.trim(), m.resource.trim()), verbs)),
                    Err(message) => report(message),
                }
            }

            let compiled = compile_rule(&name, spec, declared, &mut report);
            let Some(rule) = compiled else { continue };
            let rule = Arc::new(rule);
            for (kind, verbs) in keys {
                debug!(rule = %rule.name, kind = %kind, "Indexed rule");
                table
                    .entries
                    .entry(kind)
                    .or_default()
                    .push(TableEntry { verbs, rule: rule.clone() });
            }
            table.rules.push(rule);
        }

        if problems.is_empty() {
            Ok(table)
        } else {
            Err(RuleLoadError { problems })
        }
    }

    /// Rules indexed under `kind` whose verb set contains `verb`, in load order.
    pub fn candidates<'a>(
        &'a self,
        kind: &ResourceKind,
        verb: Verb,
    ) -> impl Iterator<Item = &'a Arc<CompiledRule>> + 'a {
        self.entries
            .get(kind)
            .into_iter()
            .flatten()
            .filter(move |e| e.verbs.contains(verb))
            .map(|e| &e.rule)
    }

    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Distinct (group/version, resource) keys, sorted.
    pub fn kinds(&self) -> Vec<&ResourceKind> {
        let mut kinds: Vec<_> = self.entries.keys().collect();
        kinds.sort();
        kinds
    }
}

fn parse_verbs(raw: &[String]) -> Result<VerbSet, String> {
    if raw.is_empty() {
        return Err("at least one verb is required".into());
    }
    let mut verbs = BTreeSet::new();
    for verb in raw {
        let verb = verb.trim().to_ascii_lowercase();
        if verb == "*" {
            return Ok(VerbSet::Any);
        }
        verbs.insert(verb.parse::<Verb>()?);
    }
    Ok(VerbSet::Only(verbs))
}

fn compile_rule(
    name: &str,
    spec: &RuleSpec,
    declared: &[String],
    report: &mut impl FnMut(String),
) -> Option<CompiledRule> {
    let mut failed = false;
    let mut fail = |message: String| {
        failed = true;
        report(message);
    };

    let condition = match spec.condition.as_deref().map(|src| Condition::parse(src, declared)) {
        Some(Ok(condition)) => Some(condition),
        Some(Err(e)) => {
            fail(format!("condition: {e}"));
            None
        }
        None => None,
    };

    let mut templates = |sources: &[String]| -> Vec<RelationshipTemplate> {
        sources
            .iter()
            .filter_map(|src| match RelationshipTemplate::parse(src, declared) {
                Ok(t) => Some(t),
                Err(e) => {
                    fail(e.to_string());
                    None
                }
            })
            .collect()
    };

    let checks = templates(&spec.checks);
    let post_sources: Vec<String> = spec
        .post_filter
        .as_slice()
        .iter()
        .map(|p| p.check_permission_template.clone())
        .collect();
    let post_filters = templates(&post_sources);
    let update = match &spec.update {
        Some(u) => UpdateTemplates {
            creates: templates(&u.create_relationships),
            deletes: templates(&u.delete_relationships),
            must_exist: templates(&u.precondition_exists),
            must_not_exist: templates(&u.precondition_does_not_exist),
        },
        None => UpdateTemplates::default(),
    };

    let mut pre_filters = Vec::new();
    for p in spec.pre_filter.as_slice() {
        match compile_pre_filter(p, declared) {
            Ok(pre) => pre_filters.push(pre),
            Err(e) => fail(e),
        }
    }

    if failed {
        return None;
    }
    Some(CompiledRule {
        name: name.to_string(),
        condition,
        checks,
        pre_filters,
        post_filters,
        update,
    })
}

fn compile_pre_filter(spec: &PreFilterSpec, declared: &[String]) -> Result<PreFilter, String> {
    let name_expr = IdTemplate::parse(&spec.from_object_id_name_expr).map_err(|e| e.to_string())?;
    let namespace_expr = spec
        .from_object_id_namespace_expr
        .as_deref()
        .map(IdTemplate::parse)
        .transpose()
        .map_err(|e| e.to_string())?;
    let lookup = RelationshipTemplate::parse_lookup(&spec.lookup_matching_resources, declared)
        .map_err(|e| e.to_string())?;
    Ok(PreFilter { name_expr, namespace_expr, lookup })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_config::parse_rules;

    const RULES: &str = r#"
- name: namespace-create
  match: { groupVersion: v1, resource: namespaces, verbs: [create] }
  update:
    preconditionDoesNotExist: ["namespace:{{name}}#creator@user:{{user.name}}"]
    createRelationships: ["namespace:{{name}}#creator@user:{{user.name}}"]
- match: { groupVersion: v1, resource: namespaces, verbs: [list, watch] }
  preFilter:
    fromObjectIDNameExpr: "{{resourceId}}"
    lookupMatchingResources: "namespace:$#view@user:{{user.name}}"
- match: { groupVersion: v1, resource: pods, verbs: ["*"] }
  condition: "verb != 'delete'"
  checks: ["namespace:{{namespace}}#view@user:{{user.name}}"]
"#;

    #[test]
    fn compiles_and_indexes_rules() {
        let table = RuleTable::compile(&parse_rules(RULES).unwrap(), &[]).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.rules()[1].name, "rule-1");

        let ns = ResourceKind::new("v1", "namespaces");
        assert_eq!(table.candidates(&ns, Verb::Create).count(), 1);
        assert_eq!(table.candidates(&ns, Verb::Watch).count(), 1);
        assert_eq!(table.candidates(&ns, Verb::Delete).count(), 0);

        let pods = ResourceKind::new("v1", "pods");
        for verb in Verb::ALL {
            assert_eq!(table.candidates(&pods, verb).count(), 1, "{verb}");
        }
    }

    #[test]
    fn collects_every_problem() {
        let bad = r#"
- name: a
  match: { groupVersion: v1, resource: pods, verbs: [get, fetch] }
  checks: ["pod:{{name}}#view@user:{{user.email}}"]
- name: b
  match: { groupVersion: v1, resource: pods, verbs: [list] }
  condition: "verb == "
  preFilter:
    fromObjectIDNameExpr: "{{resourceId.name}}"
    lookupMatchingResources: "pod:{{name}}#view@user:{{user.name}}"
"#;
        let err = RuleTable::compile(&parse_rules(bad).unwrap(), &[]).unwrap_err();
        let rules: Vec<_> = err.problems.iter().map(|p| p.rule.as_str()).collect();
        assert_eq!(rules, vec!["a", "a", "b", "b"]);
        assert!(err.to_string().contains("unknown verb 'fetch'"));
        assert!(err.to_string().contains("user.email"));
    }

    #[test]
    fn object_fields_must_be_declared() {
        let src = r#"
- match: { groupVersion: v1, resource: pods, verbs: [create] }
  condition: "object.metadata.labels.team == 'infra'"
"#;
        let specs = parse_rules(src).unwrap();
        assert!(RuleTable::compile(&specs, &[]).is_err());
        assert!(RuleTable::compile(&specs, &["metadata.labels.team".to_string()]).is_ok());
    }

    #[test]
    fn pre_filter_maps_ids_to_objects() {
        let src = r#"
- match: { groupVersion: v1, resource: pods, verbs: [list] }
  preFilter:
    fromObjectIDNameExpr: "{{resourceId.name}}"
    fromObjectIDNamespaceExpr: "{{resourceId.namespace}}"
    lookupMatchingResources: "pod:$#view@user:{{user.name}}"
"#;
        let table = RuleTable::compile(&parse_rules(src).unwrap(), &[]).unwrap();
        let pre = &table.rules()[0].pre_filters[0];
        assert_eq!(
            pre.object_for("team-a/nginx"),
            Some(ObjectName::new(Some("team-a".into()), "nginx"))
        );
        assert_eq!(pre.object_for("nginx"), None);
    }
}
