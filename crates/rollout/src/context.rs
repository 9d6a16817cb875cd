//! Collaborator traits the engine runs against
//!
//! The engine never deploys anything itself. Apps go to an [`AppExecutor`],
//! nested plan documents come from a [`SourceLoader`], and global hooks run
//! through a [`taskhooks::HookExecutor`].

use crate::plan::{App, PlanConfig};
use crate::settings::Settings;
use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use taskhooks::HookExecutor;

/// Outcome of deploying one app
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppExecution {
    pub success: bool,
    pub error: Option<String>,
    /// Opaque data handed back to [`AppExecutor::rollback`]
    pub rollback_data: Option<Value>,
}

impl AppExecution {
    pub fn succeeded(rollback_data: Option<Value>) -> Self {
        Self {
            success: true,
            error: None,
            rollback_data,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            rollback_data: None,
        }
    }

    /// Attach undo data, e.g. for a partially applied app
    pub fn with_rollback_data(mut self, data: Value) -> Self {
        self.rollback_data = Some(data);
        self
    }
}

/// Deploys and undeploys apps
///
/// Called from several workers at once when apps or phases run in parallel.
pub trait AppExecutor: Send + Sync {
    fn execute(&self, app: &App, settings: &Settings, work_dir: &Path) -> AppExecution;

    /// Undo an app from the data its execution produced
    fn rollback(&self, app_name: &str, data: &Value, settings: &Settings) -> Result<()> {
        let _ = (data, settings);
        log::debug!("no rollback action for {app_name}");
        Ok(())
    }
}

/// Loads nested plan documents referenced by `source` phases
pub trait SourceLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<PlanConfig>;
}

/// Loader for plans that have no `source` phases
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSources;

impl SourceLoader for NoSources {
    fn load(&self, path: &Path) -> Result<PlanConfig> {
        anyhow::bail!("nested sources are not supported here: {}", path.display())
    }
}

/// Everything the engine calls out to
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub apps: &'a dyn AppExecutor,
    pub loader: &'a dyn SourceLoader,
    pub hooks: Option<&'a HookExecutor<'a>>,
}

impl<'a> Collaborators<'a> {
    pub fn new(apps: &'a dyn AppExecutor, loader: &'a dyn SourceLoader) -> Self {
        Self {
            apps,
            loader,
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: &'a HookExecutor<'a>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}
