//! `relgate-config` — proxy configuration.
//!
//! Provides:
//! - Typed config schema (server, graph, backend, policy, rules, logging)
//! - YAML loading for the config file and standalone rule files
//! - `${ENV_VAR}` substitution
//! - Structural validation with field paths

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use env::{resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_raw_config, load_rules_file, parse_rules};
pub use schema::{
    BackendConfig, BackendKind, DiagnosticsConfig, GraphConfig, GraphKind, LoggingConfig, MatchSpec,
    OneOrMany, PolicyConfig, PostFilterSpec, PreFilterSpec, RelgateConfig, RetryConfig, RuleSpec,
    RulesConfig, ServerConfig, UpdateSpec,
};
pub use validation::{validate, validate_rule, ConfigValidationError, ValidationReport};

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Load a config file, substitute env vars, parse, and validate.
///
/// This is the main entry point for loading a config at runtime. Warnings are
/// logged; any error aborts the load.
pub async fn load_and_prepare(path: &Path) -> Result<RelgateConfig> {
    let raw = load_raw_config(path).await?;
    prepare(raw).with_context(|| format!("Invalid config: {}", path.display()))
}

/// The load pipeline minus file IO.
pub fn prepare(raw: Value) -> Result<RelgateConfig> {
    let value = resolve_env_vars(&raw).context("Failed to resolve env vars in config")?;
    let config: RelgateConfig =
        serde_json::from_value(value).context("Failed to deserialize config")?;

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if !report.is_valid() {
        bail!("{} config error(s); first: {}", report.errors.len(), report.errors[0]);
    }
    Ok(config)
}
