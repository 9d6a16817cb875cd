//! # taskhooks
//!
//! Lifecycle hooks for deployment steps.
//!
//! A hook is either a plain list of shell commands or an ordered list of
//! [`HookTask`]s. Each task goes through the same sequence:
//!
//! 1. **Dependency gate** - named sibling tasks must already have completed;
//!    external readiness conditions are polled until true or timed out
//! 2. **Dispatch** - apply manifest files, apply an inline payload through a
//!    transient file, or run a command with retry
//! 3. **Validation** - optional post-condition (existence or readiness)
//! 4. **Rollback** - on failure, run the task's undo steps per its trigger
//!
//! The first failing task aborts the rest of the list.
//!
//! ## Collaborators
//!
//! Process execution and manifest application are injected:
//!
//! - [`CommandRunner`]: runs commands with environment, working directory and timeout
//! - [`ManifestApplier`]: applies a manifest file to the cluster
//!
//! ## Example
//!
//! ```ignore
//! use taskhooks::{HookContext, HookExecutor, HookTask, TaskDependency};
//!
//! let executor = HookExecutor::new(&runner, &applier);
//! let ctx = HookContext::new("post_deploy", "/srv/app").with_app("api");
//! let tasks = vec![
//!     HookTask::command("migrate", "./bin/migrate"),
//!     HookTask::command("warm", "./bin/warm-cache")
//!         .with_dependency(TaskDependency::on(["migrate"])),
//! ];
//! let outcome = executor.run_tasks(&tasks, &ctx);
//! assert!(outcome.success());
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod probe;
pub mod retry;
pub mod types;

// Re-export main types at crate root
pub use context::{
    CommandRunner, ENV_APP_NAME, ENV_HOOK, ENV_NAMESPACE, HookContext, HookOptions,
    ManifestApplier,
};
pub use error::{FailureStage, TaskError};
pub use executor::{
    HookExecutor, HookOutcome, RollbackReport, RollbackStatus, TaskFailure, write_inline_manifest,
};
pub use retry::{LogCallback, RetryCallback, with_retry};
pub use types::{
    CommandFailureMode, CommandHooks, CommandOutput, CommandSpec, HookTask, Invocation,
    RetryPolicy, RollbackTrigger, StepHooks, TaskDependency, TaskKind, TaskRollback, Validation,
    WaitCondition,
};
