//! Readiness and existence probes, run through the command runner

use crate::context::{CommandRunner, HookContext, HookOptions};
use crate::error::{Result, TaskError};
use crate::types::{CommandSpec, WaitCondition};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for a single probe invocation
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the argv selecting a resource (by name or label selector)
fn selector_args(kind: &str, name: Option<&str>, selector: Option<&str>) -> Vec<String> {
    match (name, selector) {
        (Some(name), _) => vec![format!("{kind}/{name}")],
        (None, Some(selector)) => vec![kind.to_string(), "-l".to_string(), selector.to_string()],
        (None, None) => vec![kind.to_string()],
    }
}

fn namespace_args(namespace: Option<&str>) -> Vec<String> {
    namespace
        .map(|ns| vec!["-n".to_string(), ns.to_string()])
        .unwrap_or_default()
}

/// `kubectl get ... -o jsonpath=...` printing the status of `condition`
pub fn condition_argv(
    kubectl: &str,
    cond: &WaitCondition,
    namespace: Option<&str>,
) -> Vec<String> {
    let status_path = format!(
        r#".status.conditions[?(@.type=="{}")].status"#,
        cond.condition
    );
    let jsonpath = if cond.name.is_some() {
        format!("jsonpath={{{status_path}}}")
    } else {
        format!("jsonpath={{.items[*]{status_path}}}")
    };

    let mut argv = vec![kubectl.to_string(), "get".to_string()];
    argv.extend(selector_args(
        &cond.kind,
        cond.name.as_deref(),
        cond.selector.as_deref(),
    ));
    argv.extend(namespace_args(namespace));
    argv.extend(["-o".to_string(), jsonpath]);
    argv
}

/// `kubectl get ... -o name`, succeeding when the resource exists
pub fn exists_argv(
    kubectl: &str,
    kind: &str,
    name: Option<&str>,
    selector: Option<&str>,
    namespace: Option<&str>,
) -> Vec<String> {
    let mut argv = vec![kubectl.to_string(), "get".to_string()];
    argv.extend(selector_args(kind, name, selector));
    argv.extend(namespace_args(namespace));
    argv.extend(["-o".to_string(), "name".to_string()]);
    argv
}

/// Every reported status must be `True`, and there must be at least one
pub fn statuses_ready(output: &str) -> bool {
    let mut statuses = output.split_whitespace().peekable();
    statuses.peek().is_some() && statuses.all(|s| s == "True")
}

/// Probes external resources through a [`CommandRunner`]
pub struct Prober<'a> {
    runner: &'a dyn CommandRunner,
    options: &'a HookOptions,
}

impl<'a> Prober<'a> {
    pub fn new(runner: &'a dyn CommandRunner, options: &'a HookOptions) -> Self {
        Self { runner, options }
    }

    fn probe_spec(&self, argv: Vec<String>, ctx: &HookContext, budget: Duration) -> CommandSpec {
        CommandSpec::argv(argv)
            .with_timeout(budget.min(PROBE_TIMEOUT))
            .with_env(ctx.command_env())
            .with_cwd(&ctx.work_dir)
    }

    /// Single readiness check
    fn is_ready(&self, cond: &WaitCondition, ctx: &HookContext, budget: Duration) -> bool {
        let namespace = cond.namespace.as_deref().or(ctx.namespace.as_deref());
        let argv = condition_argv(&self.options.kubectl, cond, namespace);
        match self.runner.run(&self.probe_spec(argv, ctx, budget)) {
            Ok(output) if output.success() => statuses_ready(&output.stdout),
            Ok(output) => {
                log::debug!("probe {} not ready: {}", cond.target(), output.failure_summary());
                false
            }
            Err(e) => {
                log::debug!("probe {} could not run: {e}", cond.target());
                false
            }
        }
    }

    /// Block until the condition holds or its timeout elapses
    pub fn wait_until(&self, cond: &WaitCondition, ctx: &HookContext) -> Result<()> {
        let timeout = cond.timeout();
        let deadline = Instant::now() + timeout;
        log::info!(
            "[{}] waiting up to {}s for {} to be {}",
            ctx.label(),
            cond.timeout,
            cond.target(),
            cond.condition
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.is_ready(cond, ctx, remaining.max(Duration::from_secs(1))) {
                log::debug!("[{}] {} is {}", ctx.label(), cond.target(), cond.condition);
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TaskError::WaitTimedOut {
                    target: cond.target(),
                    condition: cond.condition.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            thread::sleep(self.options.poll_interval.min(remaining));
        }
    }

    /// Check that a resource exists right now
    pub fn exists(
        &self,
        kind: &str,
        name: Option<&str>,
        selector: Option<&str>,
        namespace: Option<&str>,
        ctx: &HookContext,
    ) -> std::result::Result<bool, String> {
        let argv = exists_argv(&self.options.kubectl, kind, name, selector, namespace);
        let output = self
            .runner
            .run(&self.probe_spec(argv, ctx, PROBE_TIMEOUT))
            .map_err(|e| e.to_string())?;
        Ok(output.success() && !output.stdout.trim().is_empty())
    }
}
