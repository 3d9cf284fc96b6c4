//! Config and rule file loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use crate::schema::RuleSpec;

/// Default config file name within the config directory.
const CONFIG_FILE_NAME: &str = "relgate.yaml";

/// Resolve the config directory.
/// Priority: `RELGATE_CONFIG_DIR` env > `~/.relgate/` > `./.relgate`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RELGATE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".relgate"))
        .unwrap_or_else(|| PathBuf::from(".relgate"))
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Read a config file as an untyped value tree, ready for env substitution.
///
/// A missing file yields an empty object, so every section takes its defaults.
pub async fn load_raw_config(path: &Path) -> Result<Value> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(Value::Object(Default::default()));
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let value: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;
    info!(path = %path.display(), "Loaded config");
    Ok(match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    })
}

/// Parse a rules document: either a bare list of rules or `{ rules: [...] }`.
pub fn parse_rules(raw: &str) -> Result<Vec<RuleSpec>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum RulesDoc {
        List(Vec<RuleSpec>),
        Wrapped { rules: Vec<RuleSpec> },
    }
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: RulesDoc = serde_yaml::from_str(raw).context("Failed to parse rules YAML")?;
    Ok(match doc {
        RulesDoc::List(rules) | RulesDoc::Wrapped { rules } => rules,
    })
}

/// Load rules from a YAML file.
pub async fn load_rules_file(path: &Path) -> Result<Vec<RuleSpec>> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
    let rules = parse_rules(&raw).with_context(|| format!("In rules file: {}", path.display()))?;
    info!(path = %path.display(), count = rules.len(), "Loaded rules");
    Ok(rules)
}
