//! Configuration loading.

use color_eyre::eyre::{Result, WrapErr};
use conveyor_runtime::ExecutorConfig;
use std::fs;
use std::path::Path;

/// Load executor configuration from a JSON file, or use defaults
pub fn load(path: Option<&Path>) -> Result<ExecutorConfig> {
    let Some(path) = path else {
        return Ok(ExecutorConfig::default());
    };

    let raw = fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config file {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}
