//! Hook executor - runs command lists and task lists for one lifecycle point

use crate::context::{CommandRunner, HookContext, HookOptions, ManifestApplier};
use crate::error::{Result, TaskError};
use crate::probe::Prober;
use crate::retry::{LogCallback, with_retry};
use crate::types::{
    CommandFailureMode, CommandSpec, HookTask, RollbackTrigger, StepHooks, TaskKind, Validation,
};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// What happened to a failed task's rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    /// The task has no rollback section
    NotConfigured,
    /// Disabled or trigger `never`
    Skipped,
    /// Trigger `manual`: left to an operator
    Manual,
    /// Rollback steps were run (see `errors` for step failures)
    Executed,
}

/// Rollback report for a failed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub status: RollbackStatus,
    pub errors: Vec<String>,
}

impl RollbackReport {
    fn with_status(status: RollbackStatus) -> Self {
        Self {
            status,
            errors: Vec::new(),
        }
    }

    /// Whether every rollback step that ran succeeded
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A failed task and what was done about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub error: TaskError,
    pub rollback: RollbackReport,
}

/// Result of one hook invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub point: String,
    /// Tasks (or commands) that completed, in order
    pub completed: Vec<String>,
    pub failure: Option<TaskFailure>,
}

impl HookOutcome {
    fn empty(point: &str) -> Self {
        Self {
            point: point.to_string(),
            completed: Vec::new(),
            failure: None,
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Failure message, if any
    pub fn error_message(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(|f| format!("{} hook: {}", self.point, f.error))
    }
}

/// Runs hooks through injected collaborators
pub struct HookExecutor<'a> {
    runner: &'a dyn CommandRunner,
    applier: &'a dyn ManifestApplier,
    options: HookOptions,
}

impl<'a> HookExecutor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, applier: &'a dyn ManifestApplier) -> Self {
        Self {
            runner,
            applier,
            options: HookOptions::default(),
        }
    }

    pub fn with_options(mut self, options: HookOptions) -> Self {
        self.options = options;
        self
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    pub fn applier(&self) -> &'a dyn ManifestApplier {
        self.applier
    }

    /// Run a plain command list: one attempt each, stop at the first failure
    pub fn run_commands(&self, commands: &[String], ctx: &HookContext) -> HookOutcome {
        let mut outcome = HookOutcome::empty(&ctx.point);

        for command in commands {
            log::info!("[{}] running: {}", ctx.label(), command);
            let spec = self.shell_spec(command, ctx.timeout, ctx);
            if let Err(message) = self.run_once(&spec) {
                log::error!("[{}] command failed: {}: {}", ctx.label(), command, message);
                outcome.failure = Some(TaskFailure {
                    task: command.clone(),
                    error: TaskError::dispatch(command, message),
                    rollback: RollbackReport::with_status(RollbackStatus::NotConfigured),
                });
                return outcome;
            }
            outcome.completed.push(command.clone());
        }

        outcome
    }

    /// Run an ordered task list, fail-fast
    pub fn run_tasks(&self, tasks: &[HookTask], ctx: &HookContext) -> HookOutcome {
        let mut outcome = HookOutcome::empty(&ctx.point);
        let mut completed: BTreeSet<String> = BTreeSet::new();

        for task in tasks {
            log::info!(
                "[{}] task '{}' ({})",
                ctx.label(),
                task.name,
                task.kind_label()
            );

            match self.run_task(task, ctx, &completed) {
                Ok(()) => {
                    completed.insert(task.name.clone());
                    outcome.completed.push(task.name.clone());
                }
                Err(error) => {
                    log::error!(
                        "[{}] task '{}' failed at {} stage: {}",
                        ctx.label(),
                        task.name,
                        error.stage().as_str(),
                        error
                    );
                    let rollback = self.rollback_task(task, ctx);
                    outcome.failure = Some(TaskFailure {
                        task: task.name.clone(),
                        error,
                        rollback,
                    });
                    return outcome;
                }
            }
        }

        outcome
    }

    /// Run the `pre` side of a step: commands, then tasks
    pub fn run_pre(&self, hooks: &StepHooks, ctx: &HookContext) -> HookOutcome {
        self.run_both(&hooks.pre, &hooks.pre_tasks, ctx)
    }

    /// Run the `post` side of a step: commands, then tasks
    pub fn run_post(&self, hooks: &StepHooks, ctx: &HookContext) -> HookOutcome {
        self.run_both(&hooks.post, &hooks.post_tasks, ctx)
    }

    fn run_both(&self, commands: &[String], tasks: &[HookTask], ctx: &HookContext) -> HookOutcome {
        let mut outcome = self.run_commands(commands, ctx);
        if !outcome.success() {
            return outcome;
        }
        let tasks_outcome = self.run_tasks(tasks, ctx);
        outcome.completed.extend(tasks_outcome.completed);
        outcome.failure = tasks_outcome.failure;
        outcome
    }

    fn run_task(
        &self,
        task: &HookTask,
        ctx: &HookContext,
        completed: &BTreeSet<String>,
    ) -> Result<()> {
        self.check_dependency(task, ctx, completed)?;
        self.dispatch(task, ctx)?;
        if let Some(validation) = &task.validation {
            self.validate(task, validation, ctx)?;
        }
        Ok(())
    }

    fn check_dependency(
        &self,
        task: &HookTask,
        ctx: &HookContext,
        completed: &BTreeSet<String>,
    ) -> Result<()> {
        let Some(dependency) = &task.dependency else {
            return Ok(());
        };

        if let Some(missing) = dependency
            .depends_on
            .iter()
            .find(|name| !completed.contains(*name))
        {
            return Err(TaskError::DependencyNotSatisfied {
                task: task.name.clone(),
                missing: missing.clone(),
            });
        }

        let prober = Prober::new(self.runner, &self.options);
        for cond in &dependency.wait_for {
            prober.wait_until(cond, ctx)?;
        }
        Ok(())
    }

    fn dispatch(&self, task: &HookTask, ctx: &HookContext) -> Result<()> {
        let namespace = task.namespace.as_deref().or(ctx.namespace.as_deref());

        match &task.kind {
            TaskKind::Manifests { files } => {
                for file in files {
                    let path = ctx.resolve(file);
                    log::debug!("[{}] applying {}", ctx.label(), path.display());
                    self.applier.apply(&path, namespace).map_err(|e| {
                        TaskError::dispatch(&task.name, format!("{}: {e}", path.display()))
                    })?;
                }
                Ok(())
            }
            TaskKind::Inline { content } => self
                .apply_inline(content, namespace)
                .map_err(|e| TaskError::dispatch(&task.name, e)),
            TaskKind::Command {
                command,
                retry,
                on_failure,
            } => {
                let timeout = task
                    .timeout
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.timeout);
                let spec = self.shell_spec(command, timeout, ctx);
                let policy = retry.unwrap_or_default();
                let label = format!("{} task '{}'", ctx.label(), task.name);
                let callback = LogCallback { label: &label };

                match with_retry(&policy, Some(&callback), |_| self.run_once(&spec)) {
                    Ok(()) => Ok(()),
                    Err(message) => match on_failure {
                        CommandFailureMode::Fail => Err(TaskError::dispatch(&task.name, message)),
                        CommandFailureMode::Warn => {
                            log::warn!("[{}] ignoring failure: {}", label, message);
                            Ok(())
                        }
                        CommandFailureMode::Ignore => {
                            log::debug!("[{}] failure ignored: {}", label, message);
                            Ok(())
                        }
                    },
                }
            }
        }
    }

    /// Serialize an inline payload to a transient file and apply it
    ///
    /// The file is removed when it goes out of scope, on every exit path.
    fn apply_inline(
        &self,
        content: &Value,
        namespace: Option<&str>,
    ) -> std::result::Result<(), String> {
        let file = write_inline_manifest(content)
            .map_err(|e| format!("failed to write transient manifest: {e}"))?;

        self.applier
            .apply(file.path(), namespace)
            .map_err(|e| e.to_string())
    }

    fn validate(&self, task: &HookTask, validation: &Validation, ctx: &HookContext) -> Result<()> {
        let prober = Prober::new(self.runner, &self.options);
        let namespace = validation
            .namespace
            .as_deref()
            .or(task.namespace.as_deref())
            .or(ctx.namespace.as_deref());

        if validation.wait_for_ready {
            let mut cond = validation.as_wait_condition();
            cond.namespace = namespace.map(str::to_string);
            return prober
                .wait_until(&cond, ctx)
                .map_err(|e| TaskError::validation(&task.name, e.to_string()));
        }

        let target = crate::types::resource_target(
            &validation.kind,
            validation.name.as_deref(),
            validation.selector.as_deref(),
        );
        match prober.exists(
            &validation.kind,
            validation.name.as_deref(),
            validation.selector.as_deref(),
            namespace,
            ctx,
        ) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TaskError::validation(
                &task.name,
                format!("{target} not found"),
            )),
            Err(e) => Err(TaskError::validation(
                &task.name,
                format!("could not check {target}: {e}"),
            )),
        }
    }

    fn rollback_task(&self, task: &HookTask, ctx: &HookContext) -> RollbackReport {
        let Some(rollback) = &task.rollback else {
            return RollbackReport::with_status(RollbackStatus::NotConfigured);
        };

        if !rollback.enabled || rollback.trigger == RollbackTrigger::Never {
            log::debug!("[{}] rollback for '{}' skipped", ctx.label(), task.name);
            return RollbackReport::with_status(RollbackStatus::Skipped);
        }
        if rollback.trigger == RollbackTrigger::Manual {
            log::warn!(
                "[{}] task '{}' failed; manual rollback required",
                ctx.label(),
                task.name
            );
            return RollbackReport::with_status(RollbackStatus::Manual);
        }

        log::info!("[{}] rolling back task '{}'", ctx.label(), task.name);
        let namespace = task.namespace.as_deref().or(ctx.namespace.as_deref());
        let mut report = RollbackReport::with_status(RollbackStatus::Executed);

        for manifest in &rollback.manifests {
            let path = ctx.resolve(manifest);
            if let Err(e) = self.applier.apply(&path, namespace) {
                report.errors.push(format!("{}: {e}", path.display()));
            }
        }
        for command in &rollback.commands {
            let spec = self.shell_spec(command, ctx.timeout, ctx);
            if let Err(e) = self.run_once(&spec) {
                report.errors.push(format!("{command}: {e}"));
            }
        }

        for error in &report.errors {
            log::error!("[{}] rollback step failed: {}", ctx.label(), error);
        }
        report
    }

    fn shell_spec(&self, command: &str, timeout: Duration, ctx: &HookContext) -> CommandSpec {
        CommandSpec::shell(command)
            .with_timeout(timeout)
            .with_env(ctx.command_env())
            .with_cwd(&ctx.work_dir)
    }

    fn run_once(&self, spec: &CommandSpec) -> std::result::Result<(), String> {
        match self.runner.run(spec) {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(output.failure_summary()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Write an inline payload to a transient `.json` manifest
///
/// The file is deleted when the returned handle is dropped.
pub fn write_inline_manifest(content: &Value) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("stagecraft-inline-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer_pretty(file.as_file_mut(), &inline_document(content))?;
    file.as_file_mut().flush()?;
    Ok(file)
}

/// Wrap a list of documents into a `List` so it applies as one file
fn inline_document(content: &Value) -> Value {
    match content {
        Value::Array(items) => json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": items,
        }),
        other => other.clone(),
    }
}
