//! Recursive execution engine
//!
//! One [`Engine`] runs one plan document. A level is a set of apps plus a set
//! of phases; phases either hold apps inline (run as a nested level) or point
//! at another document, which gets its own engine rooted at that document's
//! directory. All levels of one run share a single [`RollbackLedger`].
//!
//! Concurrency is per batch: a parallel app batch or phase wave gets its own
//! rayon pool of `max_workers` threads, and the batch owner folds the
//! workers' results back in declared order once the batch has returned.
//! A full (`all`) rollback requested inside a phase wave waits for the wave
//! to return, so sibling phases are never undone while still deploying.

use crate::context::Collaborators;
use crate::error::{Error, Result};
use crate::graph;
use crate::plan::{App, Phase, PhaseBody, PlanConfig};
use crate::result::{AppResult, ExecutionResult, ExecutionStatus, PhaseResult};
use crate::rollback::RollbackLedger;
use crate::settings::{self, ExecutionOrder, OnFailure, RollbackScope, Settings};
use rayon::prelude::*;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use taskhooks::HookContext;

/// `source` phases nested deeper than this are refused
pub const MAX_SOURCE_DEPTH: usize = 16;

/// What one level produced
#[derive(Debug, Default)]
struct LevelOutcome {
    apps: Vec<AppResult>,
    phases: Vec<PhaseResult>,
    failed: bool,
    /// Set once the failure policy stops further dispatch
    halted: bool,
    errors: Vec<String>,
}

impl LevelOutcome {
    fn summary(&self) -> String {
        if self.errors.is_empty() {
            "one or more units failed".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

fn child_scope(scope: &[String], name: &str) -> Vec<String> {
    let mut child = scope.to_vec();
    child.push(name.to_string());
    child
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_pool(workers: usize) -> std::result::Result<rayon::ThreadPool, String> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| format!("failed to create worker pool: {e}"))
}

/// Shared state of one run, passed down every level
#[derive(Clone, Copy)]
struct Run<'l> {
    ledger: &'l RollbackLedger,
    /// Inside a worker of a concurrent phase wave
    in_wave: bool,
}

impl<'l> Run<'l> {
    fn new(ledger: &'l RollbackLedger) -> Self {
        Self {
            ledger,
            in_wave: false,
        }
    }

    fn in_wave(self) -> Self {
        Self {
            in_wave: true,
            ..self
        }
    }
}

/// Runs one plan document against its collaborators
pub struct Engine<'a> {
    config: PlanConfig,
    work_dir: PathBuf,
    phase_order: Vec<usize>,
    collab: Collaborators<'a>,
    depth: usize,
}

impl<'a> Engine<'a> {
    /// Validate a plan and prepare it for execution
    ///
    /// Fails on duplicate names, malformed phases and phase dependency
    /// errors, before anything runs.
    pub fn new(
        config: PlanConfig,
        work_dir: impl Into<PathBuf>,
        collab: Collaborators<'a>,
    ) -> Result<Self> {
        let phase_order = config.validate()?;
        Ok(Self {
            config,
            work_dir: work_dir.into(),
            phase_order,
            collab,
            depth: 0,
        })
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Phases in the order a sequential run dispatches them
    pub fn ordered_phases(&self) -> impl Iterator<Item = &Phase> {
        self.phase_order.iter().map(|&idx| &self.config.phases[idx])
    }

    /// Phases grouped the way a parallel run dispatches them
    pub fn phase_waves(&self) -> Vec<Vec<&Phase>> {
        graph::waves(&self.config.phases)
            .unwrap_or_default()
            .into_iter()
            .map(|wave| wave.into_iter().map(|idx| &self.config.phases[idx]).collect())
            .collect()
    }

    /// Settings for this document under an optional parent
    pub fn effective_settings(&self, parent: Option<&Settings>) -> Settings {
        match parent {
            Some(parent) => settings::merge(parent, self.config.settings.as_ref()),
            None => self.config.settings.clone().unwrap_or_default(),
        }
    }

    /// Run the whole plan
    ///
    /// Never fails: everything that goes wrong ends up in the result tree.
    pub fn execute(&self, parent: Option<&Settings>) -> ExecutionResult {
        let ledger = RollbackLedger::new();
        let mut result = ExecutionResult::new();
        result.start();
        if let Some(description) = &self.config.description {
            log::info!("starting run: {description}");
        }

        let outcome = self.run_document(parent, &[], Run::new(&ledger));
        let summary = outcome.summary();
        result.apps = outcome.apps;
        result.phases = outcome.phases;
        result.mark_rolled_back(&ledger.rolled_back());

        if outcome.failed {
            log::error!("run failed: {summary}");
            result.fail(summary);
        } else {
            log::info!(
                "run succeeded: {}/{} apps deployed",
                result.successful_apps(),
                result.total_apps()
            );
            result.succeed();
        }
        result
    }

    /// A document: global hooks around its top level
    fn run_document(
        &self,
        parent: Option<&Settings>,
        scope: &[String],
        run: Run<'_>,
    ) -> LevelOutcome {
        let settings = self.effective_settings(parent);
        let hooks = self.config.hooks.clone().unwrap_or_default();

        if let Some(error) = self.run_global_hook("pre", &hooks.pre, &settings) {
            let mut outcome = LevelOutcome {
                failed: true,
                halted: true,
                errors: vec![error],
                ..Default::default()
            };
            self.run_apps(&mut outcome, &settings, &self.config.apps, scope, run);
            self.run_phases(
                &mut outcome,
                &settings,
                &self.config.phases,
                &self.phase_order,
                scope,
                run,
            );
            if let Some(error) = self.run_global_hook("on_failure", &hooks.on_failure, &settings) {
                log::warn!("{error}");
            }
            return outcome;
        }

        let mut outcome = self.run_level(
            &settings,
            &self.config.apps,
            &self.config.phases,
            &self.phase_order,
            scope,
            run,
        );

        if outcome.failed {
            if let Some(error) = self.run_global_hook("on_failure", &hooks.on_failure, &settings) {
                log::warn!("{error}");
            }
        } else if let Some(error) = self.run_global_hook("post", &hooks.post, &settings) {
            outcome.failed = true;
            outcome.errors.push(error);
        }
        outcome
    }

    /// Run a global command hook, returning its failure message
    fn run_global_hook(&self, point: &str, commands: &[String], settings: &Settings) -> Option<String> {
        if commands.is_empty() {
            return None;
        }
        let Some(hooks) = self.collab.hooks else {
            log::warn!("{point} hook configured but no hook runner available, skipping");
            return None;
        };

        let ctx = HookContext::new(point, &self.work_dir)
            .with_namespace(settings.namespace())
            .with_timeout(settings.timeout());
        hooks.run_commands(commands, &ctx).error_message()
    }

    /// Apps and phases of one level, in the configured order
    fn run_level(
        &self,
        settings: &Settings,
        apps: &[App],
        phases: &[Phase],
        phase_order: &[usize],
        scope: &[String],
        run: Run<'_>,
    ) -> LevelOutcome {
        let mut outcome = LevelOutcome::default();
        match settings.execution_order() {
            ExecutionOrder::AppsFirst => {
                self.run_apps(&mut outcome, settings, apps, scope, run);
                self.run_phases(&mut outcome, settings, phases, phase_order, scope, run);
            }
            ExecutionOrder::PhasesFirst => {
                self.run_phases(&mut outcome, settings, phases, phase_order, scope, run);
                self.run_apps(&mut outcome, settings, apps, scope, run);
            }
        }
        outcome
    }

    fn run_apps(
        &self,
        level: &mut LevelOutcome,
        settings: &Settings,
        apps: &[App],
        scope: &[String],
        run: Run<'_>,
    ) {
        let mut results: Vec<AppResult> = apps.iter().map(|a| AppResult::new(&a.name)).collect();
        if level.halted {
            level.apps = results;
            return;
        }

        let mut enabled = Vec::with_capacity(apps.len());
        for (idx, app) in apps.iter().enumerate() {
            if app.enabled {
                enabled.push(idx);
            } else {
                log::info!("skipping disabled app {}", app.name);
                results[idx].skip();
            }
        }

        if settings.parallel_apps() && enabled.len() > 1 {
            let finished = self.run_app_batch(settings, apps, &enabled);
            let mut failures = Vec::new();
            for (idx, result) in enabled.iter().copied().zip(finished) {
                run.ledger.record(scope, &result, &apps[idx].effective_settings(settings));
                if result.status == ExecutionStatus::Failed {
                    level.errors.push(app_error(&result));
                    failures.push(idx);
                }
                results[idx] = result;
            }

            let last_failed = failures
                .into_iter()
                .max_by_key(|&idx| results[idx].finished_at);
            if let Some(idx) = last_failed {
                level.failed = true;
                self.apply_policy(level, settings, scope, Some(&apps[idx].name), run);
            }
        } else {
            for &idx in &enabled {
                let app_settings = apps[idx].effective_settings(settings);
                let result = self.run_app(&apps[idx], &app_settings);
                run.ledger.record(scope, &result, &app_settings);
                let failed = result.status == ExecutionStatus::Failed;
                if failed {
                    level.errors.push(app_error(&result));
                }
                results[idx] = result;

                if failed {
                    level.failed = true;
                    self.apply_policy(level, settings, scope, Some(&apps[idx].name), run);
                    if level.halted {
                        break;
                    }
                }
            }
        }

        level.apps = results;
    }

    /// Run enabled apps concurrently; results come back in `enabled` order
    fn run_app_batch(&self, settings: &Settings, apps: &[App], enabled: &[usize]) -> Vec<AppResult> {
        let workers = settings.max_workers();
        log::info!("deploying {} apps with {} workers", enabled.len(), workers);

        match worker_pool(workers) {
            Ok(pool) => pool.install(|| {
                enabled
                    .par_iter()
                    .map(|&idx| self.run_app(&apps[idx], &apps[idx].effective_settings(settings)))
                    .collect()
            }),
            Err(error) => enabled
                .iter()
                .map(|&idx| {
                    let mut result = AppResult::new(&apps[idx].name);
                    result.start();
                    result.fail(error.clone(), None);
                    result
                })
                .collect(),
        }
    }

    fn run_app(&self, app: &App, settings: &Settings) -> AppResult {
        let mut result = AppResult::new(&app.name);
        result.start();

        let namespace = settings.namespace();
        if !settings.namespace_allowed(namespace) {
            result.fail(
                format!("namespace '{namespace}' is not in allowed_namespaces"),
                None,
            );
            return result;
        }

        log::info!("deploying app {} into {}", app.name, namespace);
        let execution = panic::catch_unwind(AssertUnwindSafe(|| {
            self.collab.apps.execute(app, settings, &self.work_dir)
        }));
        match execution {
            Ok(execution) if execution.success => {
                log::info!("app {} deployed", app.name);
                result.succeed(execution.rollback_data);
            }
            Ok(execution) => {
                let error = execution
                    .error
                    .unwrap_or_else(|| "app executor reported failure".to_string());
                log::error!("app {} failed: {}", app.name, error);
                result.fail(error, execution.rollback_data);
            }
            Err(payload) => {
                let error = format!("app executor panicked: {}", panic_message(payload.as_ref()));
                log::error!("app {} failed: {}", app.name, error);
                result.fail(error, None);
            }
        }
        result
    }

    fn run_phases(
        &self,
        level: &mut LevelOutcome,
        settings: &Settings,
        phases: &[Phase],
        order: &[usize],
        scope: &[String],
        run: Run<'_>,
    ) {
        let mut results: Vec<PhaseResult> =
            phases.iter().map(|p| PhaseResult::new(&p.name)).collect();
        if level.halted || phases.is_empty() {
            level.phases = results;
            return;
        }

        if settings.parallel() {
            self.run_phase_waves(level, &mut results, settings, phases, order, scope, run);
        } else {
            for &idx in order {
                let phase = &phases[idx];
                let phase_settings = settings::merge(settings, phase.settings.as_ref());
                let result = self.run_phase(phase, &phase_settings, scope, run);
                let failed = result.status == ExecutionStatus::Failed;
                results[idx] = result;

                if failed {
                    self.phase_failed(level, &results[idx], &phase_settings, scope, run);
                    if level.halted {
                        break;
                    }
                }
            }
        }

        level.phases = results;
    }

    /// Dispatch phases wave by wave; a dependency counts once it has run
    #[allow(clippy::too_many_arguments)]
    fn run_phase_waves(
        &self,
        level: &mut LevelOutcome,
        results: &mut [PhaseResult],
        settings: &Settings,
        phases: &[Phase],
        order: &[usize],
        scope: &[String],
        run: Run<'_>,
    ) {
        let mut pending = order.to_vec();
        let mut done: HashSet<String> = HashSet::new();

        while !pending.is_empty() {
            let wave = graph::ready_wave(phases, &pending, &done);
            if wave.is_empty() {
                let stuck: Vec<&str> = pending.iter().map(|&idx| phases[idx].name.as_str()).collect();
                log::error!("no phase is ready to run, leaving {stuck:?} undispatched");
                break;
            }
            pending.retain(|idx| !wave.contains(idx));

            let settings_for = |idx: usize| settings::merge(settings, phases[idx].settings.as_ref());
            let finished: Vec<(usize, Settings, PhaseResult)> = if wave.len() == 1 {
                let idx = wave[0];
                let phase_settings = settings_for(idx);
                let result = self.run_phase(&phases[idx], &phase_settings, scope, run);
                vec![(idx, phase_settings, result)]
            } else {
                let workers = settings.max_workers();
                log::info!("running {} phases with {} workers", wave.len(), workers);
                match worker_pool(workers) {
                    Ok(pool) => pool.install(|| {
                        wave.par_iter()
                            .map(|&idx| {
                                let phase_settings = settings_for(idx);
                                let result = self.run_phase(
                                    &phases[idx],
                                    &phase_settings,
                                    scope,
                                    run.in_wave(),
                                );
                                (idx, phase_settings, result)
                            })
                            .collect()
                    }),
                    Err(error) => wave
                        .iter()
                        .map(|&idx| {
                            let mut result = PhaseResult::new(&phases[idx].name);
                            result.start();
                            result.fail(error.clone());
                            (idx, settings_for(idx), result)
                        })
                        .collect(),
                }
            };

            for (idx, phase_settings, result) in finished {
                done.insert(phases[idx].name.clone());
                let failed = result.status == ExecutionStatus::Failed;
                results[idx] = result;
                if failed {
                    self.phase_failed(level, &results[idx], &phase_settings, scope, run);
                }
            }

            if run.ledger.has_deferred_all() {
                level.halted = true;
                if !run.in_wave && run.ledger.take_deferred_all() {
                    self.roll_back(RollbackScope::All, scope, None, run);
                }
            }
            if level.halted {
                break;
            }
        }
    }

    fn phase_failed(
        &self,
        level: &mut LevelOutcome,
        result: &PhaseResult,
        phase_settings: &Settings,
        scope: &[String],
        run: Run<'_>,
    ) {
        level.failed = true;
        level.errors.push(format!(
            "phase '{}': {}",
            result.name,
            result.error.as_deref().unwrap_or("failed")
        ));
        let phase_scope = child_scope(scope, &result.name);
        self.apply_policy(level, phase_settings, &phase_scope, None, run);
    }

    /// Run one phase, converting every kind of failure into its result
    fn run_phase(
        &self,
        phase: &Phase,
        settings: &Settings,
        scope: &[String],
        run: Run<'_>,
    ) -> PhaseResult {
        let phase_scope = child_scope(scope, &phase.name);
        let mut result = PhaseResult::new(&phase.name);
        result.start();
        log::info!("phase {} started", phase.name);

        let ran = panic::catch_unwind(AssertUnwindSafe(|| match &phase.body {
            PhaseBody::Apps(apps) => Ok(self.run_level(settings, apps, &[], &[], &phase_scope, run)),
            PhaseBody::Source(path) => self.run_source(path, settings, &phase_scope, run),
        }));

        match ran {
            Ok(Ok(outcome)) => {
                let summary = outcome.summary();
                result.apps = outcome.apps;
                result.phases = outcome.phases;
                if outcome.failed {
                    log::error!("phase {} failed: {}", phase.name, summary);
                    result.fail(summary);
                } else {
                    log::info!("phase {} finished", phase.name);
                    result.succeed();
                }
            }
            Ok(Err(error)) => {
                log::error!("phase {} failed: {}", phase.name, error);
                result.fail(error.to_string());
            }
            Err(payload) => {
                let error = format!("phase panicked: {}", panic_message(payload.as_ref()));
                log::error!("phase {} failed: {}", phase.name, error);
                result.fail(error);
            }
        }
        result
    }

    /// Load a nested document and run it with this phase's settings as parent
    fn run_source(
        &self,
        path: &Path,
        settings: &Settings,
        scope: &[String],
        run: Run<'_>,
    ) -> Result<LevelOutcome> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        if self.depth >= MAX_SOURCE_DEPTH {
            return Err(Error::NestingTooDeep {
                path,
                max: MAX_SOURCE_DEPTH,
            });
        }

        log::debug!("loading nested plan {}", path.display());
        let nested = self
            .collab
            .loader
            .load(&path)
            .map_err(|source| Error::SourceLoad {
                path: path.clone(),
                source,
            })?;
        let root = path
            .parent()
            .map_or_else(|| self.work_dir.clone(), Path::to_path_buf);

        let engine = Engine {
            depth: self.depth + 1,
            ..Engine::new(nested, root, self.collab)?
        };
        Ok(engine.run_document(Some(settings), scope, run))
    }

    /// React to a failure according to `on_failure`
    fn apply_policy(
        &self,
        level: &mut LevelOutcome,
        settings: &Settings,
        scope: &[String],
        failed_app: Option<&str>,
        run: Run<'_>,
    ) {
        match settings.on_failure() {
            OnFailure::Stop => {
                log::warn!("stopping after failure");
                level.halted = true;
            }
            OnFailure::Continue => {
                log::warn!("continuing after failure");
            }
            OnFailure::Rollback => {
                level.halted = true;
                let kind = settings.rollback_scope();
                if kind == RollbackScope::All && run.in_wave {
                    log::warn!("deferring full rollback until the phase wave returns");
                    run.ledger.defer_all();
                } else {
                    self.roll_back(kind, scope, failed_app, run);
                }
            }
        }
    }

    fn roll_back(
        &self,
        kind: RollbackScope,
        scope: &[String],
        failed_app: Option<&str>,
        run: Run<'_>,
    ) {
        let entries = match (kind, failed_app) {
            (RollbackScope::App, Some(app)) => run.ledger.take_app(scope, app),
            (RollbackScope::App, None) => run.ledger.take_last_failed(scope),
            (RollbackScope::Phase, _) => run.ledger.take_scope(scope),
            (RollbackScope::All, _) => {
                run.ledger.take_deferred_all();
                run.ledger.take_all()
            }
        };
        log::warn!("rolling back {} app(s), scope {:?}", entries.len(), kind);

        for entry in entries {
            let Some(data) = &entry.data else {
                log::debug!("no rollback data for {}, nothing to undo", entry.app);
                continue;
            };
            let undo = panic::catch_unwind(AssertUnwindSafe(|| {
                self.collab.apps.rollback(&entry.app, data, &entry.settings)
            }));
            match undo {
                Ok(Ok(())) => {
                    log::info!("rolled back {}", entry.app);
                    run.ledger.confirm(&entry);
                }
                Ok(Err(e)) => log::error!("rollback of {} failed: {e:#}", entry.app),
                Err(payload) => log::error!(
                    "rollback of {} panicked: {}",
                    entry.app,
                    panic_message(payload.as_ref())
                ),
            }
        }
    }
}

fn app_error(result: &AppResult) -> String {
    format!(
        "app '{}': {}",
        result.name,
        result.error.as_deref().unwrap_or("failed")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AppExecution, AppExecutor, NoSources, SourceLoader};
    use serde_json::{Value, json};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;
    use taskhooks::{
        CommandHooks, CommandOutput, CommandRunner, CommandSpec, HookExecutor, ManifestApplier,
    };

    #[derive(Default)]
    struct MockApps {
        failing: HashSet<String>,
        /// Failing apps that still leave undo data behind
        partial: HashSet<String>,
        panicking: HashSet<String>,
        broken_undo: HashSet<String>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<String>>,
        /// Deploy outcomes and rollbacks, in the order they happened
        events: Mutex<Vec<String>>,
        seen: Mutex<HashMap<String, Settings>>,
        rollbacks: Mutex<Vec<String>>,
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    impl MockApps {
        fn failing(names: &[&str]) -> Self {
            Self {
                failing: set(names),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn rollbacks(&self) -> Vec<String> {
            self.rollbacks.lock().unwrap().clone()
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn slow(mut self, name: &str, millis: u64) -> Self {
            self.delays
                .insert(name.to_string(), Duration::from_millis(millis));
            self
        }
    }

    impl AppExecutor for MockApps {
        fn execute(&self, app: &App, settings: &Settings, _work_dir: &Path) -> AppExecution {
            self.calls.lock().unwrap().push(app.name.clone());
            self.seen
                .lock()
                .unwrap()
                .insert(app.name.clone(), settings.clone());

            if let Some(delay) = self.delays.get(&app.name) {
                std::thread::sleep(*delay);
            }
            if self.panicking.contains(&app.name) {
                panic!("{} blew up", app.name);
            }
            let execution = if self.partial.contains(&app.name) {
                AppExecution::failed(format!("{} half applied", app.name))
                    .with_rollback_data(json!({ "undo": app.name }))
            } else if self.failing.contains(&app.name) {
                AppExecution::failed(format!("{} exploded", app.name))
            } else {
                AppExecution::succeeded(Some(json!({ "undo": app.name })))
            };
            let outcome = if execution.success { "deployed" } else { "failed" };
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {outcome}", app.name));
            execution
        }

        fn rollback(&self, app_name: &str, _data: &Value, _settings: &Settings) -> anyhow::Result<()> {
            self.rollbacks.lock().unwrap().push(app_name.to_string());
            self.events
                .lock()
                .unwrap()
                .push(format!("{app_name} rolled back"));
            if self.broken_undo.contains(app_name) {
                anyhow::bail!("cannot undo {app_name}");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MapLoader {
        docs: HashMap<PathBuf, PlanConfig>,
    }

    impl SourceLoader for MapLoader {
        fn load(&self, path: &Path) -> anyhow::Result<PlanConfig> {
            self.docs
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such plan: {}", path.display()))
        }
    }

    fn apps(names: &[&str]) -> Vec<App> {
        names
            .iter()
            .map(|name| App::command(*name, format!("deploy {name}")))
            .collect()
    }

    fn with_settings(settings: Settings, apps: Vec<App>, phases: Vec<Phase>) -> PlanConfig {
        PlanConfig {
            settings: Some(settings),
            apps,
            phases,
            ..Default::default()
        }
    }

    fn policy(on_failure: OnFailure, scope: RollbackScope) -> Settings {
        Settings {
            on_failure: Some(on_failure),
            rollback_scope: Some(scope),
            ..Default::default()
        }
    }

    fn run(config: PlanConfig, executor: &MockApps) -> ExecutionResult {
        let engine = Engine::new(config, "/plans", Collaborators::new(executor, &NoSources)).unwrap();
        engine.execute(None)
    }

    fn status(result: &ExecutionResult, scope: &[&str], app: &str) -> ExecutionStatus {
        result.app(scope, app).map(|a| a.status).unwrap()
    }

    #[test]
    fn test_stop_leaves_rest_pending() {
        let executor = MockApps::failing(&["app2"]);
        let config = with_settings(
            policy(OnFailure::Stop, RollbackScope::App),
            apps(&["app1", "app2", "app3"]),
            vec![],
        );

        let result = run(config, &executor);

        assert_eq!(status(&result, &[], "app1"), ExecutionStatus::Success);
        assert_eq!(status(&result, &[], "app2"), ExecutionStatus::Failed);
        assert_eq!(status(&result, &[], "app3"), ExecutionStatus::Pending);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("app2 exploded"));
        assert_eq!(executor.calls(), ["app1", "app2"]);
    }

    #[test]
    fn test_continue_runs_everything_but_fails_run() {
        let executor = MockApps::failing(&["app2"]);
        let config = with_settings(
            policy(OnFailure::Continue, RollbackScope::App),
            apps(&["app1", "app2", "app3"]),
            vec![],
        );

        let result = run(config, &executor);

        assert_eq!(executor.calls(), ["app1", "app2", "app3"]);
        assert_eq!(status(&result, &[], "app3"), ExecutionStatus::Success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.successful_apps(), 2);
    }

    #[test]
    fn test_rollback_app_scope_touches_only_failed_app() {
        let executor = MockApps {
            partial: set(&["x"]),
            ..Default::default()
        };
        let config = with_settings(
            policy(OnFailure::Rollback, RollbackScope::App),
            apps(&["a", "b", "x", "after"]),
            vec![],
        );

        let result = run(config, &executor);

        assert_eq!(executor.rollbacks(), ["x"]);
        assert_eq!(status(&result, &[], "a"), ExecutionStatus::Success);
        assert_eq!(status(&result, &[], "b"), ExecutionStatus::Success);
        assert_eq!(status(&result, &[], "x"), ExecutionStatus::RolledBack);
        assert_eq!(status(&result, &[], "after"), ExecutionStatus::Pending);
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_rollback_app_scope_without_data_is_noop() {
        let executor = MockApps::failing(&["x"]);
        let config = with_settings(
            policy(OnFailure::Rollback, RollbackScope::App),
            apps(&["a", "b", "x"]),
            vec![],
        );

        let result = run(config, &executor);

        assert!(executor.rollbacks().is_empty());
        assert_eq!(status(&result, &[], "x"), ExecutionStatus::Failed);
    }

    #[test]
    fn test_rollback_all_in_reverse_order() {
        let executor = MockApps::failing(&["x"]);
        let config = with_settings(
            policy(OnFailure::Rollback, RollbackScope::All),
            apps(&["a", "b", "x"]),
            vec![],
        );

        let result = run(config, &executor);

        assert_eq!(executor.rollbacks(), ["b", "a"]);
        assert_eq!(status(&result, &[], "a"), ExecutionStatus::RolledBack);
        assert_eq!(status(&result, &[], "b"), ExecutionStatus::RolledBack);
        assert_eq!(status(&result, &[], "x"), ExecutionStatus::Failed);
    }

    #[test]
    fn test_rollback_failure_is_logged_not_raised() {
        let executor = MockApps {
            failing: set(&["x"]),
            broken_undo: set(&["b"]),
            ..Default::default()
        };
        let config = with_settings(
            policy(OnFailure::Rollback, RollbackScope::All),
            apps(&["a", "b", "x"]),
            vec![],
        );

        let result = run(config, &executor);

        assert_eq!(executor.rollbacks(), ["b", "a"]);
        assert_eq!(status(&result, &[], "b"), ExecutionStatus::Success);
        assert_eq!(status(&result, &[], "a"), ExecutionStatus::RolledBack);
        assert!(result.error.as_deref().unwrap().contains("x exploded"));
    }

    #[test]
    fn test_rollback_phase_scope_stays_inside_phase() {
        let executor = MockApps::failing(&["c"]);
        let config = with_settings(
            policy(OnFailure::Rollback, RollbackScope::Phase),
            vec![],
            vec![
                Phase::with_apps("base", apps(&["a"])),
                Phase::with_apps("web", apps(&["b", "c"])).after(["base"]),
            ],
        );

        let result = run(config, &executor);

        assert_eq!(executor.rollbacks(), ["b"]);
        assert_eq!(status(&result, &["base"], "a"), ExecutionStatus::Success);
        assert_eq!(status(&result, &["web"], "b"), ExecutionStatus::RolledBack);
        assert_eq!(
            result.phase(&["web"]).unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[test]
    fn test_disabled_apps_are_skipped() {
        let executor = MockApps::default();
        let mut listed = apps(&["on", "off"]);
        listed[1] = listed[1].clone().disabled();
        let result = run(with_settings(Settings::default(), listed, vec![]), &executor);

        assert_eq!(executor.calls(), ["on"]);
        assert_eq!(status(&result, &[], "off"), ExecutionStatus::Skipped);
        assert!(result.is_success());
        assert_eq!(result.total_apps(), 2);
    }

    #[test]
    fn test_parallel_apps_run_whole_batch_before_stopping() {
        let executor = MockApps::failing(&["b"]);
        let settings = Settings {
            parallel_apps: Some(true),
            max_workers: Some(2),
            ..policy(OnFailure::Stop, RollbackScope::App)
        };
        let config = with_settings(
            settings,
            apps(&["a", "b", "c"]),
            vec![Phase::with_apps("later", apps(&["d"]))],
        );

        let result = run(config, &executor);

        let mut calls = executor.calls();
        calls.sort();
        assert_eq!(calls, ["a", "b", "c"]);
        assert_eq!(status(&result, &[], "c"), ExecutionStatus::Success);
        assert_eq!(
            result.phase(&["later"]).unwrap().status,
            ExecutionStatus::Pending
        );
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_stop_halts_remaining_phases() {
        let executor = MockApps::failing(&["a"]);
        let config = with_settings(
            Settings::default(),
            vec![],
            vec![
                Phase::with_apps("one", apps(&["a"])),
                Phase::with_apps("two", apps(&["b"])),
            ],
        );

        let result = run(config, &executor);

        assert_eq!(result.phase(&["one"]).unwrap().status, ExecutionStatus::Failed);
        assert_eq!(result.phase(&["two"]).unwrap().status, ExecutionStatus::Pending);
        assert_eq!(executor.calls(), ["a"]);
    }

    #[test]
    fn test_phase_on_failure_override() {
        let executor = MockApps::failing(&["a"]);
        let config = with_settings(
            Settings::default(),
            vec![],
            vec![
                Phase::with_apps("one", apps(&["a"]))
                    .with_settings(policy(OnFailure::Continue, RollbackScope::App)),
                Phase::with_apps("two", apps(&["b"])),
            ],
        );

        let result = run(config, &executor);

        assert_eq!(executor.calls(), ["a", "b"]);
        assert_eq!(result.phase(&["two"]).unwrap().status, ExecutionStatus::Success);
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    fn diamond(parallel: bool) -> PlanConfig {
        with_settings(
            Settings {
                parallel: Some(parallel),
                parallel_apps: Some(parallel),
                max_workers: Some(3),
                ..Default::default()
            },
            apps(&["root"]),
            vec![
                Phase::with_apps("d", apps(&["d1"])).after(["b", "c"]),
                Phase::with_apps("a", apps(&["a1", "a2"])),
                Phase::with_apps("b", apps(&["b1"])).after(["a"]),
                Phase::with_apps("c", apps(&["c1", "c2", "c3"])),
            ],
        )
    }

    fn phase_statuses(result: &ExecutionResult) -> BTreeMap<String, ExecutionStatus> {
        result
            .phases
            .iter()
            .map(|p| (p.name.clone(), p.status))
            .collect()
    }

    #[test]
    fn test_waves_match_sequential_outcome() {
        let sequential = MockApps::default();
        let parallel = MockApps::default();
        let seq = run(diamond(false), &sequential);
        let par = run(diamond(true), &parallel);

        assert_eq!(phase_statuses(&seq), phase_statuses(&par));
        assert!(seq.is_success());
        assert!(par.is_success());
        assert_eq!(par.total_apps(), 8);
        assert_eq!(par.successful_apps(), 8);

        let calls = parallel.calls();
        let pos = |name: &str| calls.iter().position(|c| c == name).unwrap();
        assert!(pos("a1") < pos("b1"));
        assert!(pos("b1") < pos("d1"));
        assert!(pos("c3") < pos("d1"));
    }

    #[test]
    fn test_waves_with_continue_still_run_dependents() {
        let settings = Settings {
            parallel: Some(true),
            ..policy(OnFailure::Continue, RollbackScope::App)
        };
        let build = |settings: Settings| {
            with_settings(
                settings,
                vec![],
                vec![
                    Phase::with_apps("a", apps(&["a1"])),
                    Phase::with_apps("b", apps(&["b1"])).after(["a"]),
                ],
            )
        };

        let parallel = run(build(settings), &MockApps::failing(&["a1"]));
        let sequential = run(
            build(policy(OnFailure::Continue, RollbackScope::App)),
            &MockApps::failing(&["a1"]),
        );
        assert_eq!(phase_statuses(&parallel), phase_statuses(&sequential));
        assert_eq!(parallel.phase(&["b"]).unwrap().status, ExecutionStatus::Success);
    }

    #[test]
    fn test_phases_first_order() {
        let executor = MockApps::default();
        let settings = Settings {
            execution_order: Some(ExecutionOrder::PhasesFirst),
            ..Default::default()
        };
        let config = with_settings(
            settings,
            apps(&["top"]),
            vec![Phase::with_apps("inner", apps(&["nested"]))],
        );

        run(config, &executor);
        assert_eq!(executor.calls(), ["nested", "top"]);
    }

    #[test]
    fn test_phase_settings_reach_apps() {
        let executor = MockApps::default();
        let config = with_settings(
            Settings {
                namespace: Some("root".into()),
                timeout: Some(100),
                ..Default::default()
            },
            apps(&["outer"]),
            vec![Phase::with_apps(
                "web",
                vec![App::command("api", "x"), App::command("worker", "x").with_namespace("jobs")],
            )
            .with_settings(Settings {
                namespace: Some("web".into()),
                ..Default::default()
            })],
        );

        run(config, &executor);
        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen["outer"].namespace(), "root");
        assert_eq!(seen["api"].namespace(), "web");
        assert_eq!(seen["api"].timeout, Some(100));
        assert_eq!(seen["worker"].namespace(), "jobs");
    }

    #[test]
    fn test_disallowed_namespace_fails_app() {
        let executor = MockApps::default();
        let settings = Settings {
            allowed_namespaces: vec!["prod".into()],
            namespace: Some("prod".into()),
            ..Default::default()
        };
        let listed = vec![App::command("ok", "x"), App::command("bad", "x").with_namespace("kube-system")];

        let result = run(with_settings(settings, listed, vec![]), &executor);

        assert_eq!(executor.calls(), ["ok"]);
        let bad = result.app(&[], "bad").unwrap();
        assert_eq!(bad.status, ExecutionStatus::Failed);
        assert!(bad.error.as_deref().unwrap().contains("kube-system"));
    }

    #[test]
    fn test_panicking_executor_becomes_failure() {
        let executor = MockApps {
            panicking: set(&["boom"]),
            ..Default::default()
        };
        let result = run(
            with_settings(
                policy(OnFailure::Continue, RollbackScope::App),
                apps(&["boom", "fine"]),
                vec![],
            ),
            &executor,
        );

        let boom = result.app(&[], "boom").unwrap();
        assert_eq!(boom.status, ExecutionStatus::Failed);
        assert!(boom.error.as_deref().unwrap().contains("boom blew up"));
        assert_eq!(status(&result, &[], "fine"), ExecutionStatus::Success);
    }

    #[test]
    fn test_nested_source_inherits_phase_settings() {
        let executor = MockApps::default();
        let nested = with_settings(
            Settings {
                namespace: Some("data".into()),
                ..Default::default()
            },
            apps(&["postgres"]),
            vec![Phase::with_apps("cache", apps(&["redis"]))],
        );
        let loader = MapLoader {
            docs: HashMap::from([(PathBuf::from("/plans/data/plan.json"), nested)]),
        };
        let config = with_settings(
            Settings {
                timeout: Some(42),
                ..Default::default()
            },
            apps(&["gateway"]),
            vec![Phase::from_source("data", "data/plan.json")],
        );

        let engine = Engine::new(config, "/plans", Collaborators::new(&executor, &loader)).unwrap();
        let result = engine.execute(None);

        assert!(result.is_success());
        assert_eq!(result.total_apps(), 3);
        assert_eq!(result.successful_apps(), 3);
        assert_eq!(status(&result, &["data"], "postgres"), ExecutionStatus::Success);
        assert_eq!(status(&result, &["data", "cache"], "redis"), ExecutionStatus::Success);

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen["postgres"].namespace(), "data");
        assert_eq!(seen["postgres"].timeout, Some(42));
        assert_eq!(seen["redis"].timeout, Some(42));
    }

    #[test]
    fn test_rollback_all_reaches_into_nested_sources() {
        let executor = MockApps::failing(&["late"]);
        let nested = PlanConfig {
            apps: apps(&["inner"]),
            ..Default::default()
        };
        let loader = MapLoader {
            docs: HashMap::from([(PathBuf::from("/plans/sub.toml"), nested)]),
        };
        let config = with_settings(
            policy(OnFailure::Rollback, RollbackScope::All),
            vec![],
            vec![
                Phase::from_source("sub", "sub.toml"),
                Phase::with_apps("final", apps(&["late"])).after(["sub"]),
            ],
        );

        let engine = Engine::new(config, "/plans", Collaborators::new(&executor, &loader)).unwrap();
        let result = engine.execute(None);

        assert_eq!(executor.rollbacks(), ["inner"]);
        assert_eq!(status(&result, &["sub"], "inner"), ExecutionStatus::RolledBack);
    }

    #[test]
    fn test_missing_source_fails_phase() {
        let executor = MockApps::default();
        let config = with_settings(
            policy(OnFailure::Continue, RollbackScope::App),
            vec![],
            vec![
                Phase::from_source("ghost", "missing.toml"),
                Phase::with_apps("other", apps(&["a"])),
            ],
        );

        let loader = MapLoader::default();
        let engine = Engine::new(config, "/plans", Collaborators::new(&executor, &loader)).unwrap();
        let result = engine.execute(None);

        let ghost = result.phase(&["ghost"]).unwrap();
        assert_eq!(ghost.status, ExecutionStatus::Failed);
        assert!(ghost.error.as_deref().unwrap().contains("missing.toml"));
        assert_eq!(status(&result, &["other"], "a"), ExecutionStatus::Success);
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_self_referencing_source_is_bounded() {
        let executor = MockApps::default();
        let looping = PlanConfig {
            phases: vec![Phase::from_source("again", "loop.json")],
            ..Default::default()
        };
        let loader = MapLoader {
            docs: HashMap::from([(PathBuf::from("/plans/loop.json"), looping.clone())]),
        };

        let engine = Engine::new(looping, "/plans", Collaborators::new(&executor, &loader)).unwrap();
        let result = engine.execute(None);

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("levels deep"));
    }

    #[test]
    fn test_new_rejects_phase_cycle() {
        let executor = MockApps::default();
        let config = PlanConfig {
            phases: vec![
                Phase::with_apps("a", vec![]).after(["c"]),
                Phase::with_apps("b", vec![]).after(["a"]),
                Phase::with_apps("c", vec![]).after(["b"]),
            ],
            ..Default::default()
        };
        let err = Engine::new(config, "/plans", Collaborators::new(&executor, &NoSources))
            .err()
            .unwrap();
        assert!(err.to_string().contains("dependency cycle"));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_phase_order_and_waves() {
        let executor = MockApps::default();
        let engine = Engine::new(diamond(false), "/plans", Collaborators::new(&executor, &NoSources))
            .unwrap();

        let order: Vec<&str> = engine.ordered_phases().map(|p| p.name.as_str()).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);

        let waves: Vec<Vec<&str>> = engine
            .phase_waves()
            .iter()
            .map(|w| w.iter().map(|p| p.name.as_str()).collect())
            .collect();
        assert_eq!(waves, vec![vec!["a", "c"], vec!["b"], vec!["d"]]);
    }

    /// Runner whose commands fail when they contain "fail"
    #[derive(Default)]
    struct HookRunner {
        ran: Mutex<Vec<String>>,
    }

    impl CommandRunner for HookRunner {
        fn run(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
            let line = spec.invocation.to_string();
            self.ran.lock().unwrap().push(line.clone());
            Ok(CommandOutput {
                exit_code: Some(i32::from(line.contains("fail"))),
                ..Default::default()
            })
        }
    }

    struct NoApply;

    impl ManifestApplier for NoApply {
        fn apply(&self, _manifest: &Path, _namespace: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn hooked(hooks: CommandHooks) -> PlanConfig {
        PlanConfig {
            apps: apps(&["a"]),
            hooks: Some(hooks),
            ..Default::default()
        }
    }

    #[test]
    fn test_failing_pre_hook_blocks_run() {
        let executor = MockApps::default();
        let runner = HookRunner::default();
        let hooks = HookExecutor::new(&runner, &NoApply);
        let config = hooked(CommandHooks {
            pre: vec!["./fail-check".into()],
            post: vec!["./notify".into()],
            on_failure: vec!["./page-oncall".into()],
        });

        let collab = Collaborators::new(&executor, &NoSources).with_hooks(&hooks);
        let result = Engine::new(config, "/plans", collab).unwrap().execute(None);

        assert!(executor.calls().is_empty());
        assert_eq!(status(&result, &[], "a"), ExecutionStatus::Pending);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(
            *runner.ran.lock().unwrap(),
            ["./fail-check", "./page-oncall"]
        );
    }

    #[test]
    fn test_failing_post_hook_fails_run() {
        let executor = MockApps::default();
        let runner = HookRunner::default();
        let hooks = HookExecutor::new(&runner, &NoApply);
        let config = hooked(CommandHooks {
            pre: vec!["./check".into()],
            post: vec!["./fail-notify".into()],
            on_failure: vec![],
        });

        let collab = Collaborators::new(&executor, &NoSources).with_hooks(&hooks);
        let result = Engine::new(config, "/plans", collab).unwrap().execute(None);

        assert_eq!(status(&result, &[], "a"), ExecutionStatus::Success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("post hook"));
    }

    #[test]
    fn test_parallel_batch_rolls_back_latest_failure_after_batch() {
        let executor = MockApps {
            partial: set(&["early", "late"]),
            ..Default::default()
        }
        .slow("early", 50)
        .slow("late", 150)
        .slow("ok", 250);
        let settings = Settings {
            parallel_apps: Some(true),
            max_workers: Some(3),
            ..policy(OnFailure::Rollback, RollbackScope::App)
        };

        let result = run(
            with_settings(settings, apps(&["early", "late", "ok"]), vec![]),
            &executor,
        );

        assert_eq!(executor.rollbacks(), ["late"]);
        let events = executor.events();
        assert_eq!(events.last().map(String::as_str), Some("late rolled back"));
        assert_eq!(events.len(), 4);
        assert_eq!(status(&result, &[], "late"), ExecutionStatus::RolledBack);
        assert_eq!(status(&result, &[], "early"), ExecutionStatus::Failed);
        assert_eq!(status(&result, &[], "ok"), ExecutionStatus::Success);
        assert!(!result.is_success());
    }

    #[test]
    fn test_full_rollback_waits_for_phase_wave() {
        let executor = MockApps {
            partial: set(&["a1"]),
            ..Default::default()
        }
        .slow("a1", 100)
        .slow("b2", 400);
        let settings = Settings {
            parallel: Some(true),
            max_workers: Some(2),
            ..policy(OnFailure::Rollback, RollbackScope::All)
        };
        let phases = vec![
            Phase::with_apps("a", apps(&["a1"])),
            Phase::with_apps("b", apps(&["b1", "b2"])),
        ];

        let result = run(with_settings(settings, vec![], phases), &executor);

        let events = executor.events();
        let deployed_b2 = events.iter().position(|e| e == "b2 deployed").unwrap();
        let first_rollback = events.iter().position(|e| e.ends_with("rolled back")).unwrap();
        assert!(first_rollback > deployed_b2, "rolled back mid-wave: {events:?}");

        let mut rolled = executor.rollbacks();
        rolled.sort();
        assert_eq!(rolled, ["a1", "b1", "b2"]);
        assert_eq!(status(&result, &["b"], "b1"), ExecutionStatus::RolledBack);
        assert_eq!(status(&result, &["b"], "b2"), ExecutionStatus::RolledBack);
        assert_eq!(status(&result, &["a"], "a1"), ExecutionStatus::RolledBack);
        assert_eq!(
            result.phase(&["b"]).map(|p| p.status),
            Some(ExecutionStatus::Success)
        );
    }

    #[test]
    fn test_phase_scope_rollback_inside_wave_spares_siblings() {
        let executor = MockApps {
            partial: set(&["a2"]),
            ..Default::default()
        }
        .slow("b1", 200);
        let settings = Settings {
            parallel: Some(true),
            max_workers: Some(2),
            ..policy(OnFailure::Rollback, RollbackScope::Phase)
        };
        let phases = vec![
            Phase::with_apps("a", apps(&["a1", "a2"])),
            Phase::with_apps("b", apps(&["b1"])),
            Phase::with_apps("c", apps(&["c1"])).after(["a"]),
        ];

        let result = run(with_settings(settings, vec![], phases), &executor);

        let mut rolled = executor.rollbacks();
        rolled.sort();
        assert_eq!(rolled, ["a1", "a2"]);
        assert_eq!(status(&result, &["b"], "b1"), ExecutionStatus::Success);
        assert_eq!(
            result.phase(&["c"]).map(|p| p.status),
            Some(ExecutionStatus::Pending)
        );
    }

    #[test]
    fn test_stop_in_wave_finishes_siblings_then_halts() {
        let executor = MockApps::failing(&["a1"]).slow("b1", 150);
        let settings = Settings {
            parallel: Some(true),
            max_workers: Some(2),
            ..policy(OnFailure::Stop, RollbackScope::App)
        };
        let phases = vec![
            Phase::with_apps("a", apps(&["a1"])),
            Phase::with_apps("b", apps(&["b1"])),
            Phase::with_apps("c", apps(&["c1"])).after(["a", "b"]),
        ];

        let result = run(with_settings(settings, vec![], phases), &executor);

        assert_eq!(status(&result, &["b"], "b1"), ExecutionStatus::Success);
        assert_eq!(status(&result, &["a"], "a1"), ExecutionStatus::Failed);
        assert_eq!(
            result.phase(&["c"]).map(|p| p.status),
            Some(ExecutionStatus::Pending)
        );
        assert!(executor.rollbacks().is_empty());
        assert!(!executor.calls().contains(&"c1".to_string()));
    }
}
