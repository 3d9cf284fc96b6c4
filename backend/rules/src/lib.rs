//! `relgate-rules` — declarative authorization rules.
//!
//! Rule specs from config are compiled once into an immutable [`RuleTable`]:
//! templates and conditions are parsed and checked against the declared
//! context fields, so nothing is parsed per request. The active table lives in
//! a [`RuleStore`] and is only ever replaced whole.

pub mod compile;
pub mod condition;
pub mod matcher;
pub mod store;
pub mod template;

pub use compile::{CompiledRule, PreFilter, RuleLoadError, RuleProblem, RuleTable, UpdateTemplates};
pub use condition::{Condition, ConditionError};
pub use matcher::{match_rules, MatchedRules};
pub use store::{collect_rule_specs, RuleStore};
pub use template::{IdTemplate, LookupQuery, RelationshipTemplate, TemplateError};
