//! Core types for hook tasks

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_condition() -> String {
    "Ready".to_string()
}

fn default_wait_timeout() -> u64 {
    300
}

fn default_validation_timeout() -> u64 {
    60
}

fn default_attempts() -> u32 {
    1
}

/// A named unit of hook work
///
/// Tasks run in declared order within one hook invocation. A task that
/// succeeds is recorded as completed, which later tasks may require via
/// `dependency.depends_on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTask {
    pub name: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<TaskDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<TaskRollback>,
    /// Namespace override for manifests and probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Per-command timeout in seconds (falls back to the hook context timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl HookTask {
    /// Create a command task with default policies
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            TaskKind::Command {
                command: command.into(),
                retry: None,
                on_failure: CommandFailureMode::Fail,
            },
        )
    }

    /// Create a manifests task
    pub fn manifests(name: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self::new(name, TaskKind::Manifests { files })
    }

    /// Create an inline manifest task
    pub fn inline(name: impl Into<String>, content: Value) -> Self {
        Self::new(name, TaskKind::Inline { content })
    }

    fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            dependency: None,
            validation: None,
            rollback: None,
            namespace: None,
            timeout: None,
        }
    }

    pub fn with_dependency(mut self, dependency: TaskDependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn with_validation(mut self, validation: Validation) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_rollback(mut self, rollback: TaskRollback) -> Self {
        self.rollback = Some(rollback);
        self
    }

    /// Names of sibling tasks that must complete first
    pub fn depends_on(&self) -> &[String] {
        self.dependency
            .as_ref()
            .map(|d| d.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Short label for the task type
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            TaskKind::Manifests { .. } => "manifests",
            TaskKind::Inline { .. } => "inline",
            TaskKind::Command { .. } => "command",
        }
    }
}

/// What a task does when dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Apply manifest files in declared order
    Manifests { files: Vec<PathBuf> },
    /// Apply an inline manifest payload through a transient file
    Inline { content: Value },
    /// Run a shell command
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
        #[serde(default)]
        on_failure: CommandFailureMode,
    },
}

/// How an exhausted command is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFailureMode {
    /// Propagate the failure
    #[default]
    Fail,
    /// Log a warning and treat as success
    Warn,
    /// Treat as success silently
    Ignore,
}

/// Fixed-delay retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts in seconds
    #[serde(default)]
    pub delay: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: 0,
        }
    }

    /// Attempts actually made (at least one)
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }
}

/// Preconditions checked before a task is dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<WaitCondition>,
}

impl TaskDependency {
    pub fn on<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            depends_on: names.into_iter().map(Into::into).collect(),
            wait_for: Vec::new(),
        }
    }
}

/// An external readiness condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitCondition {
    /// Resource kind (e.g. "deployment", "pod")
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Label selector, used when no name is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Seconds
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

impl WaitCondition {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: Some(name.into()),
            selector: None,
            condition: default_condition(),
            namespace: None,
            timeout: default_wait_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Human-readable target, e.g. `deployment/api` or `pod -l app=api`
    pub fn target(&self) -> String {
        resource_target(&self.kind, self.name.as_deref(), self.selector.as_deref())
    }
}

/// Post-condition checked after a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Block until `condition` is true instead of checking existence
    #[serde(default)]
    pub wait_for_ready: bool,
    #[serde(default = "default_condition")]
    pub condition: String,
    /// Seconds
    #[serde(default = "default_validation_timeout")]
    pub timeout: u64,
}

impl Validation {
    pub fn exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: Some(name.into()),
            selector: None,
            namespace: None,
            wait_for_ready: false,
            condition: default_condition(),
            timeout: default_validation_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// The readiness condition equivalent to this validation
    pub fn as_wait_condition(&self) -> WaitCondition {
        WaitCondition {
            kind: self.kind.clone(),
            name: self.name.clone(),
            selector: self.selector.clone(),
            condition: self.condition.clone(),
            namespace: self.namespace.clone(),
            timeout: self.timeout,
        }
    }
}

/// When a task's rollback runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Run automatically on failure
    #[default]
    Always,
    /// Leave it to an operator
    Manual,
    Never,
}

/// Undo steps for a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRollback {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: RollbackTrigger,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

impl TaskRollback {
    pub fn commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            trigger: RollbackTrigger::Always,
            manifests: Vec::new(),
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_trigger(mut self, trigger: RollbackTrigger) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Hooks attached to a lifecycle step (e.g. `deploy`)
///
/// Command lists run first, then task lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepHooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_tasks: Vec<HookTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_tasks: Vec<HookTask>,
}

impl StepHooks {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty()
            && self.post.is_empty()
            && self.on_failure.is_empty()
            && self.pre_tasks.is_empty()
            && self.post_tasks.is_empty()
    }
}

/// Global command hooks around a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
}

/// How a command is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Interpreted by `sh -c`
    Shell(String),
    /// Program and arguments, no shell
    Argv(Vec<String>),
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell(command) => f.write_str(command),
            Self::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// A command to run through a [`crate::CommandRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub invocation: Invocation,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(Invocation::Shell(command.into()))
    }

    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Invocation::Argv(argv.into_iter().map(Into::into).collect()))
    }

    fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            timeout: None,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Captured output of a finished (or killed) command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or timed out
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Best single-line explanation of a failure
    pub fn failure_summary(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match (self.exit_code, detail.is_empty()) {
            (Some(code), true) => format!("exit code {code}"),
            (Some(code), false) => format!("exit code {code}: {detail}"),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {detail}"),
        }
    }
}

pub(crate) fn resource_target(kind: &str, name: Option<&str>, selector: Option<&str>) -> String {
    match (name, selector) {
        (Some(name), _) => format!("{kind}/{name}"),
        (None, Some(selector)) => format!("{kind} -l {selector}"),
        (None, None) => kind.to_string(),
    }
}
