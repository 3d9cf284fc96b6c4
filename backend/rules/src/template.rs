//! Relationship templates.
//!
//! A template such as `pod:{{namespace}}/{{name}}#creator@user:{{user.name}}`
//! is parsed once into literal and placeholder segments per tuple part.
//! Placeholders are checked against the context schema at parse time, so
//! rendering can only fail when a referenced value is absent, and then it
//! fails closed.

use std::collections::BTreeMap;

use relgate_core::tuple::split_tuple;
use relgate_core::{ContextField, RelationshipTuple, RequestContext, SubjectRef};
use thiserror::Error;

/// The resource id slot in lookup templates (`namespace:$#view@user:{{user.name}}`).
const SLOT: &str = "$";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template '{template}': expected type:id#relation@subjectType:subjectId")]
    Malformed { template: String },
    #[error("template '{template}': unclosed placeholder")]
    Unclosed { template: String },
    #[error("template '{template}': unknown placeholder '{placeholder}'")]
    UnknownPlaceholder { template: String, placeholder: String },
    #[error("template '{template}': '$' is only allowed as the resource id of a lookup")]
    UnexpectedSlot { template: String },
    #[error("template '{template}': lookup templates need '$' as the resource id")]
    MissingSlot { template: String },
    #[error("template '{template}': no value for '{field}'")]
    MissingField { template: String, field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<F> {
    Literal(String),
    Field(F),
}

/// Split `raw` into literal / `{{placeholder}}` segments, resolving each
/// placeholder name through `field`.
fn parse_segments<F>(
    raw: &str,
    template: &str,
    field: impl Fn(&str) -> Option<F>,
) -> Result<Vec<Segment<F>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unclosed { template: template.to_string() })?;
        let name = after[..close].trim();
        let parsed = field(name).ok_or_else(|| TemplateError::UnknownPlaceholder {
            template: template.to_string(),
            placeholder: name.to_string(),
        })?;
        segments.push(Segment::Field(parsed));
        rest = &after[close + 2..];
    }
    if rest.contains("}}") {
        return Err(TemplateError::Malformed { template: template.to_string() });
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Slot,
    Segments(Vec<Segment<ContextField>>),
}

/// A compiled relationship template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipTemplate {
    source: String,
    parts: [Part; 5],
}

/// A rendered lookup: which resources of a type does this subject reach?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQuery {
    pub resource_type: String,
    pub permission: String,
    pub subject: SubjectRef,
}

impl RelationshipTemplate {
    /// Parse a plain relationship template.
    pub fn parse(source: &str, declared: &[String]) -> Result<Self, TemplateError> {
        let template = Self::parse_inner(source, declared)?;
        if template.parts.iter().any(|p| matches!(p, Part::Slot)) {
            return Err(TemplateError::UnexpectedSlot { template: source.to_string() });
        }
        Ok(template)
    }

    /// Parse a lookup template whose resource id is the `$` slot.
    pub fn parse_lookup(source: &str, declared: &[String]) -> Result<Self, TemplateError> {
        let template = Self::parse_inner(source, declared)?;
        for (i, part) in template.parts.iter().enumerate() {
            match (i, part) {
                (1, Part::Slot) => {}
                (1, _) => return Err(TemplateError::MissingSlot { template: source.to_string() }),
                (_, Part::Slot) => {
                    return Err(TemplateError::UnexpectedSlot { template: source.to_string() })
                }
                _ => {}
            }
        }
        Ok(template)
    }

    fn parse_inner(source: &str, declared: &[String]) -> Result<Self, TemplateError> {
        let raw = split_tuple(source.trim())
            .map_err(|_| TemplateError::Malformed { template: source.to_string() })?;
        let part = |raw: &str| -> Result<Part, TemplateError> {
            if raw == SLOT {
                return Ok(Part::Slot);
            }
            parse_segments(raw, source, |name| ContextField::parse(name, declared)).map(Part::Segments)
        };
        Ok(Self {
            source: source.to_string(),
            parts: [part(raw[0])?, part(raw[1])?, part(raw[2])?, part(raw[3])?, part(raw[4])?],
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every context field this template references.
    pub fn fields(&self) -> Vec<&ContextField> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Segments(segs) => Some(segs),
                Part::Slot => None,
            })
            .flatten()
            .filter_map(|s| match s {
                Segment::Field(f) => Some(f),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    fn render_part(&self, part: &Part, ctx: &RequestContext) -> Result<Vec<String>, TemplateError> {
        let segments = match part {
            Part::Slot => return Ok(vec![SLOT.to_string()]),
            Part::Segments(segments) => segments,
        };
        let mut rendered = vec![String::new()];
        for segment in segments {
            match segment {
                Segment::Literal(lit) => rendered.iter_mut().for_each(|r| r.push_str(lit)),
                Segment::Field(field) => {
                    let values = ctx.resolve(field).ok_or_else(|| TemplateError::MissingField {
                        template: self.source.clone(),
                        field: field.to_string(),
                    })?;
                    rendered = rendered
                        .iter()
                        .flat_map(|prefix| values.iter().map(move |v| format!("{prefix}{v}")))
                        .collect();
                }
            }
        }
        Ok(rendered)
    }

    /// Render against `ctx`. Multi-valued fields (`user.groups`) fan out into
    /// one tuple per value; every other field yields exactly one tuple.
    pub fn render(&self, ctx: &RequestContext) -> Result<Vec<RelationshipTuple>, TemplateError> {
        let mut rendered: Vec<Vec<String>> = vec![Vec::new()];
        for part in &self.parts {
            let values = self.render_part(part, ctx)?;
            rendered = rendered
                .iter()
                .flat_map(|prefix| {
                    values.iter().map(move |v| {
                        let mut next = prefix.clone();
                        next.push(v.clone());
                        next
                    })
                })
                .collect();
        }
        Ok(rendered
            .into_iter()
            .map(|p| RelationshipTuple::new(&p[0], &p[1], &p[2], &p[3], &p[4]))
            .collect())
    }

    /// Render a lookup template into one query per subject.
    pub fn render_lookup(&self, ctx: &RequestContext) -> Result<Vec<LookupQuery>, TemplateError> {
        Ok(self
            .render(ctx)?
            .into_iter()
            .map(|t| LookupQuery {
                subject: t.subject(),
                resource_type: t.resource_type,
                permission: t.relation,
            })
            .collect())
    }

    /// Recover the placeholder bindings that produced `tuple`, keyed by field
    /// name. Returns `None` when the tuple could not have come from this template.
    pub fn extract(&self, tuple: &RelationshipTuple) -> Option<BTreeMap<String, String>> {
        let values = [
            &tuple.resource_type,
            &tuple.resource_id,
            &tuple.relation,
            &tuple.subject_type,
            &tuple.subject_id,
        ];
        let mut bindings = BTreeMap::new();
        for (part, value) in self.parts.iter().zip(values) {
            match part {
                Part::Slot => {}
                Part::Segments(segs) => {
                    if !match_segments(segs, value, &mut bindings) {
                        return None;
                    }
                }
            }
        }
        Some(bindings)
    }
}

/// Backtracking match of segments against `s`, binding placeholders
/// shortest-first. A field bound earlier must match the same text again.
fn match_segments(
    segments: &[Segment<ContextField>],
    s: &str,
    bindings: &mut BTreeMap<String, String>,
) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return s.is_empty();
    };
    match first {
        Segment::Literal(lit) => s
            .strip_prefix(lit.as_str())
            .is_some_and(|r| match_segments(rest, r, bindings)),
        Segment::Field(field) => {
            let key = field.to_string();
            if let Some(bound) = bindings.get(&key).cloned() {
                return s
                    .strip_prefix(bound.as_str())
                    .is_some_and(|r| match_segments(rest, r, bindings));
            }
            for end in (1..=s.len()).filter(|i| s.is_char_boundary(*i)) {
                let mut attempt = bindings.clone();
                attempt.insert(key.clone(), s[..end].to_string());
                if match_segments(rest, &s[end..], &mut attempt) {
                    *bindings = attempt;
                    return true;
                }
            }
            false
        }
    }
}

/// Placeholders available to pre-filter id expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdField {
    /// The full looked-up resource id.
    Full,
    /// Part after the last `/` (or the whole id).
    Name,
    /// Part before the last `/`; absent for ids without one.
    Namespace,
}

/// Maps a looked-up resource id back to a backend name or namespace,
/// e.g. `{{resourceId.name}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTemplate {
    source: String,
    segments: Vec<Segment<IdField>>,
}

impl IdTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let segments = parse_segments(source.trim(), source, |name| match name {
            "resourceId" => Some(IdField::Full),
            "resourceId.name" => Some(IdField::Name),
            "resourceId.namespace" => Some(IdField::Namespace),
            _ => None,
        })?;
        Ok(Self { source: source.to_string(), segments })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render for one resource id; `None` when a referenced part is absent.
    pub fn render(&self, resource_id: &str) -> Option<String> {
        let (namespace, name) = match resource_id.rsplit_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, resource_id),
        };
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Field(IdField::Full) => out.push_str(resource_id),
                Segment::Field(IdField::Name) => out.push_str(name),
                Segment::Field(IdField::Namespace) => out.push_str(namespace?),
            }
        }
        Some(out).filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::{ResourceKind, UserInfo, Verb};

    fn ctx() -> RequestContext {
        RequestContext::new(
            Verb::Create,
            ResourceKind::new("v1", "pods"),
            UserInfo::new("alice", vec!["dev".into(), "ops".into()]),
        )
        .with_namespace(Some("team-a".into()))
        .with_name(Some("nginx".into()))
        .with_field("metadata.labels.owner", "carol")
    }

    fn declared() -> Vec<String> {
        vec!["metadata.labels.owner".into()]
    }

    #[test]
    fn renders_creator_tuple() {
        let t = RelationshipTemplate::parse("pod:{{name}}#creator@user:{{user.name}}", &[]).unwrap();
        let tuples = t.render(&ctx()).unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].to_string(), "pod:nginx#creator@user:alice");
    }

    #[test]
    fn renders_namespaced_ids_and_object_fields() {
        let t = RelationshipTemplate::parse(
            "pod:{{namespace}}/{{name}}#owner@user:{{object.metadata.labels.owner}}",
            &declared(),
        )
        .unwrap();
        assert_eq!(t.render(&ctx()).unwrap()[0].to_string(), "pod:team-a/nginx#owner@user:carol");
        let r = RelationshipTemplate::parse("pod:{{resourceId}}#view@user:{{ user.name }}", &[]).unwrap();
        assert_eq!(r.render(&ctx()).unwrap()[0].resource_id, "team-a/nginx");
    }

    #[test]
    fn groups_fan_out() {
        let t = RelationshipTemplate::parse("namespace:{{namespace}}#viewer@group:{{user.groups}}", &[]).unwrap();
        let rendered: Vec<String> = t.render(&ctx()).unwrap().iter().map(|t| t.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["namespace:team-a#viewer@group:dev", "namespace:team-a#viewer@group:ops"]
        );
    }

    #[test]
    fn missing_fields_fail_closed() {
        let t = RelationshipTemplate::parse("pod:{{name}}#creator@user:{{user.name}}", &[]).unwrap();
        let err = t.render(&ctx().with_name(None)).unwrap_err();
        assert!(matches!(err, TemplateError::MissingField { ref field, .. } if field == "name"));
        let groups = RelationshipTemplate::parse("pod:{{name}}#viewer@group:{{user.groups}}", &[]).unwrap();
        let mut no_groups = ctx();
        no_groups.user.groups.clear();
        assert!(groups.render(&no_groups).is_err());
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(
            RelationshipTemplate::parse("pod:{{name}}#creator", &[]),
            Err(TemplateError::Malformed { .. })
        ));
        assert!(matches!(
            RelationshipTemplate::parse("pod:{{name#creator@user:{{user.name}}", &[]),
            Err(TemplateError::Malformed { .. }) | Err(TemplateError::Unclosed { .. })
        ));
        assert!(matches!(
            RelationshipTemplate::parse("pod:{{nam}}#creator@user:{{user.name}}", &[]),
            Err(TemplateError::UnknownPlaceholder { .. })
        ));
        assert!(matches!(
            RelationshipTemplate::parse("pod:$#view@user:{{user.name}}", &[]),
            Err(TemplateError::UnexpectedSlot { .. })
        ));
        assert!(matches!(
            RelationshipTemplate::parse_lookup("pod:{{name}}#view@user:{{user.name}}", &[]),
            Err(TemplateError::MissingSlot { .. })
        ));
    }

    #[test]
    fn lookup_templates_render_queries() {
        let t = RelationshipTemplate::parse_lookup("namespace:$#view@user:{{user.name}}", &[]).unwrap();
        let queries = t.render_lookup(&ctx()).unwrap();
        assert_eq!(
            queries,
            vec![LookupQuery {
                resource_type: "namespace".into(),
                permission: "view".into(),
                subject: SubjectRef::new("user", "alice"),
            }]
        );
    }

    #[test]
    fn rendering_then_extracting_round_trips() {
        let sources = [
            "pod:{{name}}#creator@user:{{user.name}}",
            "pod:{{namespace}}/{{name}}#{{verb}}@user:{{user.name}}",
            "{{resource}}:{{resourceId}}#owner@user:{{object.metadata.labels.owner}}",
        ];
        let c = ctx();
        for src in sources {
            let t = RelationshipTemplate::parse(src, &declared()).unwrap();
            for tuple in t.render(&c).unwrap() {
                let bindings = t.extract(&tuple).unwrap();
                for field in t.fields() {
                    let expected = c.resolve(field).unwrap();
                    assert_eq!(bindings.get(&field.to_string()), expected.first(), "{src}");
                }
            }
        }
    }

    #[test]
    fn extract_rejects_foreign_tuples() {
        let t = RelationshipTemplate::parse("pod:{{name}}#creator@user:{{user.name}}", &[]).unwrap();
        let foreign: RelationshipTuple = "namespace:x#creator@user:alice".parse().unwrap();
        assert!(t.extract(&foreign).is_none());
    }

    #[test]
    fn id_templates_split_resource_ids() {
        let name = IdTemplate::parse("{{resourceId.name}}").unwrap();
        let ns = IdTemplate::parse("{{resourceId.namespace}}").unwrap();
        let full = IdTemplate::parse("{{resourceId}}").unwrap();
        assert_eq!(name.render("team-a/nginx").as_deref(), Some("nginx"));
        assert_eq!(ns.render("team-a/nginx").as_deref(), Some("team-a"));
        assert_eq!(ns.render("nginx"), None);
        assert_eq!(full.render("nginx").as_deref(), Some("nginx"));
        assert!(IdTemplate::parse("{{name}}").is_err());
    }
}
