//! Rule matching.
//!
//! Lookup order is (group/version, resource) → verb → condition. Every rule
//! that survives contributes: checks are ANDed, filters all apply, and update
//! templates are unioned. An empty result means no rule covers the request;
//! what to do then is the caller's policy decision.

use std::sync::Arc;

use relgate_core::RequestContext;
use tracing::debug;

use crate::compile::{CompiledRule, PreFilter, RuleTable};
use crate::template::RelationshipTemplate;

/// The rules that apply to one request.
#[derive(Debug, Clone, Default)]
pub struct MatchedRules {
    rules: Vec<Arc<CompiledRule>>,
}

impl MatchedRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn checks(&self) -> impl Iterator<Item = &RelationshipTemplate> {
        self.rules.iter().flat_map(|r| r.checks.iter())
    }

    pub fn pre_filters(&self) -> impl Iterator<Item = &PreFilter> {
        self.rules.iter().flat_map(|r| r.pre_filters.iter())
    }

    pub fn post_filters(&self) -> impl Iterator<Item = &RelationshipTemplate> {
        self.rules.iter().flat_map(|r| r.post_filters.iter())
    }

    pub fn creates(&self) -> impl Iterator<Item = &RelationshipTemplate> {
        self.rules.iter().flat_map(|r| r.update.creates.iter())
    }

    pub fn deletes(&self) -> impl Iterator<Item = &RelationshipTemplate> {
        self.rules.iter().flat_map(|r| r.update.deletes.iter())
    }

    pub fn must_exist(&self) -> impl Iterator<Item = &RelationshipTemplate> {
        self.rules.iter().flat_map(|r| r.update.must_exist.iter())
    }

    pub fn must_not_exist(&self) -> impl Iterator<Item = &RelationshipTemplate> {
        self.rules.iter().flat_map(|r| r.update.must_not_exist.iter())
    }

    /// Whether any matched rule declares relationship side effects.
    pub fn has_updates(&self) -> bool {
        self.rules.iter().any(|r| !r.update.is_empty())
    }
}

/// Find every rule in `table` that applies to `ctx`. Pure: no IO, no logging
/// beyond debug traces.
pub fn match_rules(table: &RuleTable, ctx: &RequestContext) -> MatchedRules {
    let rules: Vec<_> = table
        .candidates(&ctx.kind, ctx.verb)
        .filter(|rule| {
            let applies = rule.applies(ctx);
            if !applies {
                debug!(rule = %rule.name, "Condition excluded rule");
            }
            applies
        })
        .cloned()
        .collect();
    debug!(kind = %ctx.kind, verb = %ctx.verb, matched = rules.len(), "Matched rules");
    MatchedRules { rules }
}
