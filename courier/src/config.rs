//! Configuration file discovery and loading.

use std::path::{Path, PathBuf};

use courier_delivery::{LivenessOptions, SenderOptions};
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Locations tried, in order, when [`CONFIG_ENV`] is unset.
pub const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

#[derive(Debug, Deserialize)]
pub struct CourierConfig {
    pub sender: SenderOptions,
    #[serde(default)]
    pub liveness: LivenessOptions,
}

impl CourierConfig {
    /// Reads and validates a RON configuration file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, is not valid RON, or describes an
    /// unusable sender.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
    }

    /// # Errors
    ///
    /// Fails if `content` is not valid RON or describes an unusable sender.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = ron::from_str(content)?;
        config.sender.validate()?;
        Ok(config)
    }
}

/// Find the configuration file using the following precedence:
/// 1. an explicit path (from `--config`)
/// 2. `COURIER_CONFIG` environment variable
/// 3. ./courier.config.ron (current working directory)
/// 4. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Fails if an explicitly named file does not exist or no default exists.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let from_env = std::env::var(CONFIG_ENV).ok();
    resolve(explicit, from_env.as_deref(), &DEFAULT_PATHS.map(PathBuf::from))
}

fn resolve(
    explicit: Option<&Path>,
    from_env: Option<&str>,
    defaults: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = from_env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
