use anyhow::{Context, Result};
use encore_core::config::Config;
use std::path::{Path, PathBuf};

/// Locations searched when no `--config` is given, in order.
const DEFAULT_PATHS: [&str; 3] = [
    "./encore.toml",
    "~/.config/encore/config.toml",
    "/etc/encore/config.toml",
];

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let config = Config::from_toml(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    for warning in config.validate() {
        tracing::warn!("{warning}");
    }
    Ok(config)
}

/// First existing default config file, if any.
pub fn find_default_config() -> Option<PathBuf> {
    DEFAULT_PATHS.iter().find_map(|p| {
        let path = PathBuf::from(shellexpand::tilde(p).as_ref());
        path.exists().then_some(path)
    })
}

/// Load config from the given path, the default locations, or defaults
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }
    match find_default_config() {
        Some(path) => {
            tracing::debug!("Using config file {}", path.display());
            load_config(&path)
        }
        None => Ok(Config::default()),
    }
}
