//! Plan files and user defaults
//!
//! Plans are TOML or JSON, picked by file extension. User-wide defaults live
//! in `settings.toml` under the config directory (see [`crate::paths`]).

use crate::paths;
use anyhow::{Context, Result, bail};
use rollout::{PhaseBody, PlanConfig, Settings, SourceLoader};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the user defaults file inside the config directory
pub const USER_SETTINGS_FILE: &str = "settings.toml";

/// On-disk format of a plan document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(other) => bail!("Unsupported plan format '.{}': {}", other, path.display()),
            None => bail!("Plan file has no extension: {}", path.display()),
        }
    }

    pub fn parse<T: serde::de::DeserializeOwned>(self, content: &str) -> Result<T> {
        match self {
            Self::Toml => toml::from_str(content).context("Invalid TOML"),
            Self::Json => serde_json::from_str(content).context("Invalid JSON"),
        }
    }
}

/// Read and parse a plan document
///
/// Apps are reordered by their `depends_on` and `~`/`$VAR` in `source`
/// paths are expanded. Relative paths stay relative to the file's directory.
pub fn load_plan(path: &Path) -> Result<PlanConfig> {
    let format = ConfigFormat::from_path(path)?;
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read plan: {}", path.display()))?;
    let mut plan: PlanConfig = format
        .parse(&content)
        .with_context(|| format!("Invalid plan: {}", path.display()))?;

    for phase in &mut plan.phases {
        if let PhaseBody::Source(source) = &mut phase.body {
            *source = paths::expand(&source.to_string_lossy());
        }
    }
    plan.order_apps()
        .with_context(|| format!("Invalid app dependencies in {}", path.display()))?;

    log::debug!(
        "Loaded plan {} ({} phases, {} apps)",
        path.display(),
        plan.phases.len(),
        plan.declared_apps()
    );
    Ok(plan)
}

/// Directory that relative paths in a plan are resolved against
pub fn plan_root(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Load user defaults, if the file exists
pub fn load_user_settings() -> Result<Option<Settings>> {
    let path = paths::config_dir()?.join(USER_SETTINGS_FILE);
    load_settings_file(&path)
}

fn load_settings_file(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        log::debug!("No user settings at {}", path.display());
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    let settings = toml::from_str(&content)
        .with_context(|| format!("Invalid TOML format in {}", path.display()))?;
    Ok(Some(settings))
}

/// Loads nested plans referenced by `source` phases from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSourceLoader;

impl SourceLoader for FileSourceLoader {
    fn load(&self, path: &Path) -> Result<PlanConfig> {
        load_plan(path)
    }
}
