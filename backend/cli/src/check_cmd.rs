//! `relgate check-rules`: compile a rules file and report every problem.

use std::path::Path;

use anyhow::{bail, Result};
use relgate_config::{load_rules_file, validate_rule, RuleSpec, ValidationReport};
use relgate_rules::{CompiledRule, RuleTable};

use crate::terminal_output::{note_error, note_success, note_warn, render_table};

pub async fn run(path: &Path, object_fields: &[String]) -> Result<()> {
    let specs = load_rules_file(path).await?;

    let mut report = ValidationReport::default();
    for (i, spec) in specs.iter().enumerate() {
        validate_rule(spec, &format!("[{i}]"), &mut report);
    }
    for warning in &report.warnings {
        note_warn(&format!("{}: {}", warning.path, warning.message));
    }
    for error in &report.errors {
        note_error(&format!("{}: {}", error.path, error.message));
    }

    match RuleTable::compile(&specs, object_fields) {
        Ok(table) if report.is_valid() => {
            print!("{}", render_table(&["RULE", "MATCH", "CHECKS", "PRE", "POST", "UPDATES"], &rows(&specs, table.rules())));
            note_success(&format!("{} rule(s) compiled from {}", table.len(), path.display()));
            Ok(())
        }
        Ok(_) => bail!("{} invalid rule(s) in {}", report.errors.len(), path.display()),
        Err(e) => {
            for problem in &e.problems {
                note_error(&problem.to_string());
            }
            bail!("{} invalid rule(s) in {}", e.problems.len() + report.errors.len(), path.display())
        }
    }
}

fn rows(specs: &[RuleSpec], rules: &[std::sync::Arc<CompiledRule>]) -> Vec<Vec<String>> {
    specs
        .iter()
        .zip(rules)
        .map(|(spec, rule)| {
            let matches = spec
                .matches
                .as_slice()
                .iter()
                .map(|m| format!("{}/{} [{}]", m.group_version, m.resource, m.verbs.join(",")))
                .collect::<Vec<_>>()
                .join(" ");
            let updates = rule.update.creates.len()
                + rule.update.deletes.len()
                + rule.update.must_exist.len()
                + rule.update.must_not_exist.len();
            vec![
                rule.name.clone(),
                matches,
                rule.checks.len().to_string(),
                rule.pre_filters.len().to_string(),
                rule.post_filters.len().to_string(),
                updates.to_string(),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(tag: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("relgate-check-{tag}-{}.yaml", std::process::id()));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn accepts_valid_rules() {
        let path = write(
            "ok",
            "- name: pods\n  match: { groupVersion: v1, resource: pods, verbs: [get] }\n  checks: [\"pod:{{name}}#view@user:{{user.name}}\"]\n",
        );
        run(&path, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_placeholder() {
        let path = write(
            "bad",
            "- match: { groupVersion: v1, resource: pods, verbs: [get] }\n  checks: [\"pod:{{nme}}#view@user:{{user.name}}\"]\n",
        );
        assert!(run(&path, &[]).await.is_err());
    }
}
