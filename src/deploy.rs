//! App executor backed by shell commands and kubectl
//!
//! Each app runs as: `pre_deploy` hooks, the deployment itself, then
//! `post_deploy` hooks. Any failure runs the app's `on_failure` commands.
//! What was deployed is recorded as [`Undo`] data so the engine can roll it
//! back later.

use crate::paths;
use crate::runner::KubectlApplier;
use anyhow::{Context, Result, bail};
use rollout::{App, AppExecution, AppExecutor, AppSpec, Settings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use taskhooks::{
    CommandRunner, CommandSpec, HookContext, HookExecutor, HookOptions, ManifestApplier,
    StepHooks, write_inline_manifest,
};

/// How to reverse a deployed app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Undo {
    /// Run the app's undo command
    Command { command: String, work_dir: PathBuf },
    /// Delete applied manifest files, newest first
    Delete {
        manifests: Vec<PathBuf>,
        namespace: String,
    },
    /// Delete an inline document
    DeleteInline { content: Value, namespace: String },
}

impl Undo {
    fn to_value(&self) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("could not record rollback data: {e}");
                None
            }
        }
    }
}

/// A deployment that stopped part-way
struct DeployFailure {
    message: String,
    /// Undo for what had been applied before the failure
    partial: Option<Undo>,
}

impl DeployFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: None,
        }
    }
}

/// Deploys apps with a [`CommandRunner`] and kubectl
pub struct ShellAppExecutor<'a> {
    runner: &'a dyn CommandRunner,
    options: HookOptions,
}

impl<'a> ShellAppExecutor<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            options: HookOptions::default(),
        }
    }

    fn applier(&self, settings: &Settings) -> KubectlApplier<'a> {
        KubectlApplier::new(self.runner, settings.timeout())
            .with_kubectl(self.options.kubectl.clone())
            .with_kubeconfig(settings.kubeconfig.clone())
            .with_context(settings.kube_context.clone())
    }

    fn context(point: &str, app: &str, settings: &Settings, work_dir: &Path) -> HookContext {
        let mut ctx = HookContext::new(point, work_dir)
            .with_app(app)
            .with_namespace(settings.namespace())
            .with_timeout(settings.timeout());
        if let Some(kubeconfig) = &settings.kubeconfig {
            ctx = ctx.with_env("KUBECONFIG", kubeconfig.clone());
        }
        ctx
    }

    fn run_shell(&self, command: &str, ctx: &HookContext) -> Result<()> {
        let spec = CommandSpec::shell(command)
            .with_timeout(ctx.timeout)
            .with_env(ctx.command_env())
            .with_cwd(&ctx.work_dir);
        let output = self.runner.run(&spec)?;
        if output.success() {
            Ok(())
        } else {
            bail!("'{}' failed: {}", command, output.failure_summary())
        }
    }

    fn deploy(
        &self,
        app: &App,
        ctx: &HookContext,
        applier: &KubectlApplier<'_>,
    ) -> std::result::Result<Option<Undo>, DeployFailure> {
        let namespace = ctx.namespace.clone().unwrap_or_default();

        match &app.spec {
            AppSpec::Command { command, undo } => {
                self.run_shell(command, ctx)
                    .map_err(|e| DeployFailure::new(e.to_string()))?;
                Ok(undo.as_ref().map(|undo| Undo::Command {
                    command: undo.clone(),
                    work_dir: ctx.work_dir.clone(),
                }))
            }
            AppSpec::Manifests { files } => {
                let mut applied = Vec::new();
                for file in files {
                    let path = paths::resolve(&ctx.work_dir, file);
                    if let Err(e) = applier.apply(&path, Some(&namespace)) {
                        return Err(DeployFailure {
                            message: format!("apply {} failed: {e}", path.display()),
                            partial: (!applied.is_empty()).then(|| Undo::Delete {
                                manifests: applied,
                                namespace: namespace.clone(),
                            }),
                        });
                    }
                    applied.push(path);
                }
                Ok(Some(Undo::Delete {
                    manifests: applied,
                    namespace,
                }))
            }
            AppSpec::Inline { content } => {
                let file = write_inline_manifest(content).map_err(|e| {
                    DeployFailure::new(format!("could not write inline manifest: {e}"))
                })?;
                applier
                    .apply(file.path(), Some(&namespace))
                    .map_err(|e| DeployFailure::new(format!("apply inline content failed: {e}")))?;
                Ok(Some(Undo::DeleteInline {
                    content: content.clone(),
                    namespace,
                }))
            }
        }
    }

    fn on_failure(&self, hooks: &HookExecutor<'_>, step: &StepHooks, ctx: &HookContext) {
        let outcome = hooks.run_commands(&step.on_failure, &ctx.at("on_failure"));
        if let Some(error) = outcome.error_message() {
            log::error!("[{}] {}", ctx.label(), error);
        }
    }

    fn undo(&self, undo: &Undo, app_name: &str, settings: &Settings) -> Result<()> {
        let applier = self.applier(settings);
        match undo {
            Undo::Command { command, work_dir } => {
                let ctx = Self::context("rollback", app_name, settings, work_dir);
                self.run_shell(command, &ctx)
            }
            Undo::Delete {
                manifests,
                namespace,
            } => {
                for manifest in manifests.iter().rev() {
                    applier.delete(manifest, Some(namespace))?;
                }
                Ok(())
            }
            Undo::DeleteInline { content, namespace } => {
                let file = write_inline_manifest(content)
                    .context("Could not write inline manifest")?;
                applier.delete(file.path(), Some(namespace))
            }
        }
    }
}

impl AppExecutor for ShellAppExecutor<'_> {
    fn execute(&self, app: &App, settings: &Settings, work_dir: &Path) -> AppExecution {
        let applier = self.applier(settings);
        let hooks = HookExecutor::new(self.runner, &applier).with_options(self.options.clone());
        let step = app.hooks.clone().unwrap_or_default();
        let ctx = Self::context("pre_deploy", &app.name, settings, work_dir);

        let pre = hooks.run_pre(&step, &ctx);
        if let Some(error) = pre.error_message() {
            self.on_failure(&hooks, &step, &ctx);
            return AppExecution::failed(error);
        }

        let undo = match self.deploy(app, &ctx.at("deploy"), &applier) {
            Ok(undo) => undo,
            Err(failure) => {
                log::error!("[{}] {}", ctx.label(), failure.message);
                self.on_failure(&hooks, &step, &ctx);
                let execution = AppExecution::failed(failure.message);
                return match failure.partial.as_ref().and_then(Undo::to_value) {
                    Some(data) => execution.with_rollback_data(data),
                    None => execution,
                };
            }
        };
        let data = undo.as_ref().and_then(Undo::to_value);

        let post = hooks.run_post(&step, &ctx.at("post_deploy"));
        if let Some(error) = post.error_message() {
            self.on_failure(&hooks, &step, &ctx);
            let execution = AppExecution::failed(error);
            return match data {
                Some(data) => execution.with_rollback_data(data),
                None => execution,
            };
        }

        log::info!("deployed {} into {}", app.name, settings.namespace());
        AppExecution::succeeded(data)
    }

    fn rollback(&self, app_name: &str, data: &Value, settings: &Settings) -> Result<()> {
        let undo: Undo = serde_json::from_value(data.clone())
            .with_context(|| format!("Invalid rollback data for {app_name}"))?;
        log::info!("rolling back {app_name}");
        self.undo(&undo, app_name, settings)
    }
}
