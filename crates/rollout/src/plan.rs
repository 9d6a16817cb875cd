//! Declarative plan model: apps grouped into dependency-ordered phases

use crate::error::{Error, Result};
use crate::graph::{self, Dependent};
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use taskhooks::{CommandHooks, StepHooks};

/// What an app deploys
///
/// The engine never looks inside; only the app executor does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppSpec {
    /// Shell command, with an optional command that undoes it
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        undo: Option<String>,
    },
    /// Manifest files applied in order
    Manifests { files: Vec<PathBuf> },
    /// A manifest document embedded in the plan
    Inline { content: Value },
}

fn default_true() -> bool {
    true
}

/// One deployable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sibling apps that must come first (applied when the plan is loaded)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub spec: AppSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<StepHooks>,
}

impl App {
    pub fn new(name: impl Into<String>, spec: AppSpec) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            depends_on: Vec::new(),
            namespace: None,
            spec,
            hooks: None,
        }
    }

    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            AppSpec::Command {
                command: command.into(),
                undo: None,
            },
        )
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_hooks(mut self, hooks: StepHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Settings this app runs with: the level's settings plus its namespace
    pub fn effective_settings(&self, level: &Settings) -> Settings {
        match &self.namespace {
            Some(namespace) => crate::settings::merge(
                level,
                Some(&Settings {
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                }),
            ),
            None => level.clone(),
        }
    }
}

impl Dependent for App {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

/// What a phase runs
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseBody {
    /// A nested plan document, resolved relative to the enclosing plan
    Source(PathBuf),
    /// Apps declared inline
    Apps(Vec<App>),
}

/// A named, dependency-ordered group of apps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPhase", into = "RawPhase")]
pub struct Phase {
    pub name: String,
    pub description: Option<String>,
    pub depends_on: Vec<String>,
    pub settings: Option<Settings>,
    pub body: PhaseBody,
}

impl Phase {
    pub fn with_apps(name: impl Into<String>, apps: Vec<App>) -> Self {
        Self::new(name, PhaseBody::Apps(apps))
    }

    pub fn from_source(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, PhaseBody::Source(path.into()))
    }

    fn new(name: impl Into<String>, body: PhaseBody) -> Self {
        Self {
            name: name.into(),
            description: None,
            depends_on: Vec::new(),
            settings: None,
            body,
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Inline apps, empty for source phases
    pub fn apps(&self) -> &[App] {
        match &self.body {
            PhaseBody::Apps(apps) => apps,
            PhaseBody::Source(_) => &[],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidPhase {
                phase: self.name.clone(),
                reason: "name is empty".to_string(),
            });
        }
        if let PhaseBody::Apps(apps) = &self.body {
            unique_app_names(apps)?;
        }
        Ok(())
    }
}

impl Dependent for Phase {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

/// Wire shape of a phase: exactly one of `source` / `apps`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPhase {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    settings: Option<Settings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    apps: Option<Vec<App>>,
}

impl TryFrom<RawPhase> for Phase {
    type Error = Error;

    fn try_from(raw: RawPhase) -> Result<Self> {
        let body = match (raw.source, raw.apps) {
            (Some(source), None) => PhaseBody::Source(source),
            (None, Some(apps)) => PhaseBody::Apps(apps),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidPhase {
                    phase: raw.name,
                    reason: "declares both 'source' and 'apps'".to_string(),
                });
            }
            (None, None) => {
                return Err(Error::InvalidPhase {
                    phase: raw.name,
                    reason: "needs either 'source' or 'apps'".to_string(),
                });
            }
        };

        let phase = Self {
            name: raw.name,
            description: raw.description,
            depends_on: raw.depends_on,
            settings: raw.settings,
            body,
        };
        phase.validate()?;
        Ok(phase)
    }
}

impl From<Phase> for RawPhase {
    fn from(phase: Phase) -> Self {
        let (source, apps) = match phase.body {
            PhaseBody::Source(path) => (Some(path), None),
            PhaseBody::Apps(apps) => (None, Some(apps)),
        };
        Self {
            name: phase.name,
            description: phase.description,
            depends_on: phase.depends_on,
            settings: phase.settings,
            source,
            apps,
        }
    }
}

/// A plan document: root settings, apps, phases and global hooks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<App>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<CommandHooks>,
}

impl PlanConfig {
    /// Check names and phase dependencies, returning the phase order
    pub fn validate(&self) -> Result<Vec<usize>> {
        unique_app_names(&self.apps)?;
        for phase in &self.phases {
            phase.validate()?;
        }
        Ok(graph::topological_order(&self.phases)?)
    }

    /// Reorder every app set by its apps' `depends_on`
    pub fn order_apps(&mut self) -> Result<()> {
        order_app_set(&mut self.apps)?;
        for phase in &mut self.phases {
            if let PhaseBody::Apps(apps) = &mut phase.body {
                order_app_set(apps)?;
            }
        }
        Ok(())
    }

    /// Apps declared directly in this document, including inline phases
    pub fn declared_apps(&self) -> usize {
        self.apps.len() + self.phases.iter().map(|p| p.apps().len()).sum::<usize>()
    }
}

fn unique_app_names(apps: &[App]) -> Result<()> {
    let mut seen = HashSet::new();
    for app in apps {
        if !seen.insert(app.name.as_str()) {
            return Err(Error::DuplicateApp(app.name.clone()));
        }
    }
    Ok(())
}

fn order_app_set(apps: &mut Vec<App>) -> Result<()> {
    if apps.iter().all(|a| a.depends_on.is_empty()) {
        return Ok(());
    }
    let order = graph::topological_order(apps)?;
    let mut slots: Vec<Option<App>> = std::mem::take(apps).into_iter().map(Some).collect();
    *apps = order.into_iter().filter_map(|idx| slots[idx].take()).collect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use serde_json::json;

    #[test]
    fn test_phase_requires_exactly_one_body() {
        let both: std::result::Result<Phase, _> = serde_json::from_value(json!({
            "name": "db",
            "source": "db.toml",
            "apps": []
        }));
        assert!(both.unwrap_err().to_string().contains("both 'source' and 'apps'"));

        let neither: std::result::Result<Phase, _> =
            serde_json::from_value(json!({ "name": "db" }));
        assert!(neither.unwrap_err().to_string().contains("either 'source' or 'apps'"));
    }

    #[test]
    fn test_phase_rejects_duplicate_apps() {
        let dup: std::result::Result<Phase, _> = serde_json::from_value(json!({
            "name": "web",
            "apps": [
                { "name": "api", "type": "command", "command": "true" },
                { "name": "api", "type": "command", "command": "true" }
            ]
        }));
        assert!(dup.unwrap_err().to_string().contains("duplicate app 'api'"));
    }

    #[test]
    fn test_parse_plan_from_toml() {
        let plan: PlanConfig = toml::from_str(
            r#"
            description = "staging"

            [settings]
            namespace = "staging"
            on_failure = "rollback"

            [[apps]]
            name = "crds"
            type = "manifests"
            files = ["crds/a.yaml", "crds/b.yaml"]

            [[phases]]
            name = "data"
            source = "data/plan.toml"

            [[phases]]
            name = "web"
            depends_on = ["data"]

            [[phases.apps]]
            name = "api"
            type = "command"
            command = "./deploy.sh api"
            undo = "./undo.sh api"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(plan.settings.as_ref().unwrap().namespace(), "staging");
        assert_eq!(
            plan.apps[0].spec,
            AppSpec::Manifests {
                files: vec!["crds/a.yaml".into(), "crds/b.yaml".into()]
            }
        );
        assert_eq!(plan.phases[0].body, PhaseBody::Source("data/plan.toml".into()));
        let web = &plan.phases[1];
        assert_eq!(web.depends_on, ["data"]);
        assert!(!web.apps()[0].enabled);
        assert_eq!(plan.validate().unwrap(), vec![0, 1]);
        assert_eq!(plan.declared_apps(), 2);
    }

    #[test]
    fn test_validate_rejects_phase_cycle() {
        let plan = PlanConfig {
            phases: vec![
                Phase::with_apps("a", vec![]).after(["b"]),
                Phase::with_apps("b", vec![]).after(["a"]),
            ],
            ..Default::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(Error::Graph(GraphError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_order_apps_by_dependencies() {
        let mut plan = PlanConfig {
            apps: vec![
                App::command("api", "true").after(["db"]),
                App::command("db", "true"),
                App::command("cache", "true"),
            ],
            ..Default::default()
        };
        plan.order_apps().unwrap();
        let names: Vec<&str> = plan.apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["db", "api", "cache"]);
    }

    #[test]
    fn test_app_namespace_overrides_level() {
        let level = Settings {
            namespace: Some("shared".into()),
            timeout: Some(30),
            ..Default::default()
        };
        let app = App::command("api", "true").with_namespace("api");
        let effective = app.effective_settings(&level);
        assert_eq!(effective.namespace(), "api");
        assert_eq!(effective.timeout, Some(30));
    }

    #[test]
    fn test_phase_round_trips_through_wire_shape() {
        let phase = Phase::from_source("nested", "nested/plan.json").after(["base"]);
        let value = serde_json::to_value(&phase).unwrap();
        assert_eq!(value["source"], json!("nested/plan.json"));
        assert!(value.get("apps").is_none());
        let back: Phase = serde_json::from_value(value).unwrap();
        assert_eq!(back, phase);
    }
}
