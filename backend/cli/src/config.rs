//! Locating and loading the proxy configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relgate_config::{config_dir, config_file_path, load_and_prepare, RelgateConfig};

/// `--config` if given, otherwise `relgate.yaml` in the config directory.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_file_path(&config_dir()))
}

pub async fn load(explicit: Option<&Path>) -> Result<(PathBuf, RelgateConfig)> {
    let path = resolve_path(explicit);
    let config = load_and_prepare(&path)
        .await
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok((path, config))
}
