//! Collaborator traits and per-invocation context
//!
//! These traits allow the hook runner to be used without depending on a
//! specific process launcher or cluster client.

use crate::types::{CommandOutput, CommandSpec};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the lifecycle point name
pub const ENV_HOOK: &str = "STAGECRAFT_HOOK";
/// Environment variable carrying the app name, when the hook belongs to an app
pub const ENV_APP_NAME: &str = "STAGECRAFT_APP_NAME";
/// Environment variable carrying the target namespace
pub const ENV_NAMESPACE: &str = "STAGECRAFT_NAMESPACE";

/// Runs external processes
///
/// Implementations must be safe to call from several workers at once.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion (or until its timeout elapses)
    ///
    /// A non-zero exit is reported through [`CommandOutput`], not as `Err`;
    /// `Err` means the process could not be launched at all.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Applies manifest files to the target cluster
pub trait ManifestApplier: Send + Sync {
    /// Apply a manifest file, optionally into a specific namespace
    fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<()>;
}

/// Tunables for the hook executor
#[derive(Debug, Clone)]
pub struct HookOptions {
    /// Binary used for readiness probes and validations
    pub kubectl: String,
    /// Delay between readiness probes
    pub poll_interval: Duration,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Context for one hook invocation
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Lifecycle point, e.g. `pre`, `post_deploy`
    pub point: String,
    pub app_name: Option<String>,
    pub namespace: Option<String>,
    pub work_dir: PathBuf,
    /// Caller-supplied environment, injected into every command
    pub env: BTreeMap<String, String>,
    /// Default timeout for commands run under this hook
    pub timeout: Duration,
}

impl HookContext {
    pub fn new(point: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            point: point.into(),
            app_name: None,
            namespace: None,
            work_dir: work_dir.into(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_app(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same context at another lifecycle point
    pub fn at(&self, point: impl Into<String>) -> Self {
        Self {
            point: point.into(),
            ..self.clone()
        }
    }

    /// Environment for a command: caller pairs plus the hook identity
    pub fn command_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert(ENV_HOOK.to_string(), self.point.clone());
        if let Some(app) = &self.app_name {
            env.insert(ENV_APP_NAME.to_string(), app.clone());
        }
        if let Some(namespace) = &self.namespace {
            env.insert(ENV_NAMESPACE.to_string(), namespace.clone());
        }
        env
    }

    /// Resolve a path relative to the working directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    /// Label used in log lines
    pub fn label(&self) -> String {
        match &self.app_name {
            Some(app) => format!("{}:{}", app, self.point),
            None => self.point.clone(),
        }
    }
}
