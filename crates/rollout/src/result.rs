//! Execution results: per-unit status, timing and the result tree

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Lifecycle of an app, phase or whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Allowed moves of the unit state machine
    pub fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Success | Self::Failed)
                | (Self::Success | Self::Failed, Self::RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::RolledBack
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply a transition, refusing (and logging) illegal ones
fn advance(unit: &str, status: &mut ExecutionStatus, next: ExecutionStatus) -> bool {
    if status.can_become(next) {
        *status = next;
        true
    } else {
        log::warn!("refusing transition {status} -> {next} for '{unit}'");
        false
    }
}

fn elapsed(
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> Option<chrono::Duration> {
    Some(finished_at? - started_at?)
}

/// Outcome of one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppResult {
    pub name: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque undo data produced by the app executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<Value>,
}

impl AppResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            rollback_data: None,
        }
    }

    pub fn start(&mut self) {
        if advance(&self.name, &mut self.status, ExecutionStatus::Running) {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self, rollback_data: Option<Value>) {
        if advance(&self.name, &mut self.status, ExecutionStatus::Success) {
            self.finished_at = Some(Utc::now());
            self.rollback_data = rollback_data;
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, rollback_data: Option<Value>) {
        if advance(&self.name, &mut self.status, ExecutionStatus::Failed) {
            self.finished_at = Some(Utc::now());
            self.error = Some(error.into());
            self.rollback_data = rollback_data;
        }
    }

    pub fn skip(&mut self) {
        advance(&self.name, &mut self.status, ExecutionStatus::Skipped);
    }

    pub fn mark_rolled_back(&mut self) {
        advance(&self.name, &mut self.status, ExecutionStatus::RolledBack);
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        elapsed(self.started_at, self.finished_at)
    }
}

/// Outcome of one phase, including everything it ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseResult>,
}

impl PhaseResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            apps: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        if advance(&self.name, &mut self.status, ExecutionStatus::Running) {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self) {
        if advance(&self.name, &mut self.status, ExecutionStatus::Success) {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if advance(&self.name, &mut self.status, ExecutionStatus::Failed) {
            self.finished_at = Some(Utc::now());
            self.error = Some(error.into());
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        elapsed(self.started_at, self.finished_at)
    }

    pub fn total_apps(&self) -> usize {
        count_apps(&self.apps, &self.phases, |_| true)
    }

    pub fn successful_apps(&self) -> usize {
        count_apps(&self.apps, &self.phases, |a| {
            a.status == ExecutionStatus::Success
        })
    }
}

fn count_apps(apps: &[AppResult], phases: &[PhaseResult], pred: fn(&AppResult) -> bool) -> usize {
    apps.iter().filter(|a| pred(a)).count()
        + phases
            .iter()
            .map(|p| count_apps(&p.apps, &p.phases, pred))
            .sum::<usize>()
}

/// Identifies an app in the result tree: enclosing phase names plus app name
pub type AppKey = (Vec<String>, String);

fn mark_tree(
    scope: &mut Vec<String>,
    apps: &mut [AppResult],
    phases: &mut [PhaseResult],
    keys: &HashSet<AppKey>,
) {
    for app in apps {
        if keys.contains(&(scope.clone(), app.name.clone())) {
            app.mark_rolled_back();
        }
    }
    for phase in phases {
        scope.push(phase.name.clone());
        mark_tree(scope, &mut phase.apps, &mut phase.phases, keys);
        scope.pop();
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseResult>,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionResult {
    pub fn new() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            apps: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        if advance("run", &mut self.status, ExecutionStatus::Running) {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self) {
        if advance("run", &mut self.status, ExecutionStatus::Success) {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if advance("run", &mut self.status, ExecutionStatus::Failed) {
            self.finished_at = Some(Utc::now());
            self.error = Some(error.into());
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        elapsed(self.started_at, self.finished_at)
    }

    pub fn total_apps(&self) -> usize {
        count_apps(&self.apps, &self.phases, |_| true)
    }

    pub fn successful_apps(&self) -> usize {
        count_apps(&self.apps, &self.phases, |a| {
            a.status == ExecutionStatus::Success
        })
    }

    /// Find an app by phase path and name
    pub fn app(&self, scope: &[&str], name: &str) -> Option<&AppResult> {
        let mut apps = &self.apps;
        let mut phases = &self.phases;
        for segment in scope {
            let phase = phases.iter().find(|p| p.name == *segment)?;
            apps = &phase.apps;
            phases = &phase.phases;
        }
        apps.iter().find(|a| a.name == name)
    }

    /// Find a phase by its path
    pub fn phase(&self, path: &[&str]) -> Option<&PhaseResult> {
        let (first, rest) = path.split_first()?;
        let mut phase = self.phases.iter().find(|p| p.name == *first)?;
        for segment in rest {
            phase = phase.phases.iter().find(|p| p.name == *segment)?;
        }
        Some(phase)
    }

    /// Move the given apps to `RolledBack`
    pub fn mark_rolled_back(&mut self, keys: &HashSet<AppKey>) {
        if keys.is_empty() {
            return;
        }
        mark_tree(&mut Vec::new(), &mut self.apps, &mut self.phases, keys);
    }
}
