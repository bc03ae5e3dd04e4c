//! Engine configuration file.
//!
//! Read-only TOML at `~/.config/pixelflash/engine.toml`. Every key is
//! optional; missing keys fall back to the engine defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use pixelflash_engine::EngineConfig;

/// Default location of the configuration file.
pub fn config_path() -> PathBuf {
    config_base_dir().join("pixelflash").join("engine.toml")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}

pub fn parse(content: &str) -> anyhow::Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(content).context("invalid engine config")?;
    config.validate()?;
    Ok(config)
}

/// Loads the configuration.
///
/// An explicit path must exist. The default path is optional, and a broken
/// default file is reported and ignored.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<EngineConfig> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        return parse(&content).with_context(|| format!("in {}", path.display()));
    }

    let path = config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    match std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|content| parse(&content))
    {
        Ok(config) => {
            tracing::debug!(path = %path.display(), "engine config loaded");
            Ok(config)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load engine config, using defaults"
            );
            Ok(EngineConfig::default())
        }
    }
}
