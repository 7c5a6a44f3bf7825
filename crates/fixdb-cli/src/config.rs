use std::path::{Path, PathBuf};

use fixdb_core::StoreConfig;
use serde::{Deserialize, Serialize};

/// Contents of `fixdb.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Fixture directory used when `--dir` is not given.
    pub fixtures: Option<PathBuf>,
    pub store: StoreConfig,
}

impl CliConfig {
    /// The fixture directory to load: `--dir`, then the config file, then `.`.
    pub fn fixtures_dir(&self, dir: Option<PathBuf>) -> PathBuf {
        dir.or_else(|| self.fixtures.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("fixdb.toml")
}

/// Read the config file. A missing default file yields defaults; a missing
/// explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig, String> {
    let explicit = path.is_some();
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        if explicit {
            return Err(format!("config file not found: {}", path.display()));
        }
        return Ok(CliConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let config: CliConfig =
        toml::from_str(&contents).map_err(|e| format!("invalid config {}: {e}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}
