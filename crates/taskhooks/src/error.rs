//! Error types for hook task execution.
//!
//! Every task failure falls into one stage of the per-task sequence, so the
//! caller can tell a dependency gate apart from the task's own work.

use thiserror::Error;

/// Stage of the per-task sequence where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Dependency gate or readiness wait
    Dependency,
    /// The task's own work
    Dispatch,
    /// Post-condition check
    Validation,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dependency => "dependency",
            Self::Dispatch => "dispatch",
            Self::Validation => "validation",
        }
    }
}

/// Errors raised while running a hook task
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// A sibling task named in `depends_on` has not completed
    #[error("task '{task}' depends on '{missing}', which has not completed")]
    DependencyNotSatisfied { task: String, missing: String },

    /// A readiness condition did not become true in time
    #[error("timed out after {timeout_secs}s waiting for {target} to be {condition}")]
    WaitTimedOut {
        target: String,
        condition: String,
        timeout_secs: u64,
    },

    /// The task's own work failed
    #[error("task '{task}' failed: {message}")]
    DispatchFailed { task: String, message: String },

    /// The post-condition did not hold
    #[error("validation of task '{task}' failed: {message}")]
    ValidationFailed { task: String, message: String },
}

impl TaskError {
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::DependencyNotSatisfied { .. } | Self::WaitTimedOut { .. } => {
                FailureStage::Dependency
            }
            Self::DispatchFailed { .. } => FailureStage::Dispatch,
            Self::ValidationFailed { .. } => FailureStage::Validation,
        }
    }

    pub(crate) fn dispatch(task: &str, message: impl Into<String>) -> Self {
        Self::DispatchFailed {
            task: task.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn validation(task: &str, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            task: task.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for task execution
pub type Result<T> = std::result::Result<T, TaskError>;
