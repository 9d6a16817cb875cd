//! Layered settings and the inheritance merge
//!
//! Every field is optional so that "not set" can be told apart from "set to
//! the default". Effective values (with defaults applied) come from the
//! accessor methods, never from the raw fields.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// What to do when an app or phase fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop dispatching further units
    #[default]
    Stop,
    /// Keep going; the run is still reported as failed
    Continue,
    /// Stop and roll back per `rollback_scope`
    Rollback,
}

/// Blast radius of an automatic rollback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackScope {
    /// Only the failed app
    #[default]
    App,
    /// Every app executed in the failing phase
    Phase,
    /// Every app executed in the whole run
    All,
}

/// Whether a level's own apps run before or after its child phases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    #[default]
    AppsFirst,
    PhasesFirst,
}

/// Credentials for a remote chart/image repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

/// Orchestration-wide options, layered from the root down through phases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the kubeconfig used by deployment actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<OnFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_scope: Option<RollbackScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<ExecutionOrder>,
    /// Run ready phases concurrently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    /// Run a level's apps concurrently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_apps: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repositories: BTreeMap<String, RepoCredential>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_namespaces: Vec<String>,
    /// Free-form values handed to app executors
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
}

impl Settings {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn on_failure(&self) -> OnFailure {
        self.on_failure.unwrap_or_default()
    }

    pub fn rollback_scope(&self) -> RollbackScope {
        self.rollback_scope.unwrap_or_default()
    }

    pub fn execution_order(&self) -> ExecutionOrder {
        self.execution_order.unwrap_or_default()
    }

    pub fn parallel(&self) -> bool {
        self.parallel.unwrap_or(false)
    }

    pub fn parallel_apps(&self) -> bool {
        self.parallel_apps.unwrap_or(false)
    }

    /// Worker count for a concurrent batch, never below one
    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS).max(1)
    }

    /// Whether an app may deploy into `namespace`
    ///
    /// An empty allow-list permits every namespace.
    pub fn namespace_allowed(&self, namespace: &str) -> bool {
        self.allowed_namespaces.is_empty() || self.allowed_namespaces.iter().any(|n| n == namespace)
    }
}

/// Inheritance merge: `parent.merge(child)` layers `child` over `parent`
///
/// Implementations never mutate either side.
pub trait Merge: Clone {
    fn merge(&self, child: &Self) -> Self;

    /// How a child is stored where the parent has nothing to merge into
    fn adopt(child: &Self) -> Self {
        child.clone()
    }
}

impl Merge for Settings {
    fn merge(&self, child: &Self) -> Self {
        Self {
            kubeconfig: merge_text(&self.kubeconfig, &child.kubeconfig),
            kube_context: merge_text(&self.kube_context, &child.kube_context),
            namespace: merge_text(&self.namespace, &child.namespace),
            timeout: merge_option(&self.timeout, &child.timeout),
            on_failure: merge_option(&self.on_failure, &child.on_failure),
            rollback_scope: merge_option(&self.rollback_scope, &child.rollback_scope),
            execution_order: merge_option(&self.execution_order, &child.execution_order),
            parallel: merge_option(&self.parallel, &child.parallel),
            parallel_apps: merge_option(&self.parallel_apps, &child.parallel_apps),
            max_workers: merge_option(&self.max_workers, &child.max_workers),
            repositories: merge_map(&self.repositories, &child.repositories),
            labels: merge_map(&self.labels, &child.labels),
            allowed_namespaces: merge_list(&self.allowed_namespaces, &child.allowed_namespaces),
            values: merge_map(&self.values, &child.values),
        }
    }
}

impl Merge for RepoCredential {
    fn merge(&self, child: &Self) -> Self {
        Self {
            url: merge_text(&self.url, &child.url),
            username: merge_text(&self.username, &child.username),
            password: merge_text(&self.password, &child.password),
            insecure: merge_option(&self.insecure, &child.insecure),
        }
    }
}

impl Merge for String {
    fn merge(&self, child: &Self) -> Self {
        if child.is_empty() {
            self.clone()
        } else {
            child.clone()
        }
    }
}

impl Merge for Value {
    fn merge(&self, child: &Self) -> Self {
        match (self, child) {
            (Value::Object(parent), Value::Object(child)) => {
                let mut merged = parent.clone();
                for (key, value) in child {
                    let next = match parent.get(key) {
                        Some(existing) => existing.merge(value),
                        None => Self::adopt(value),
                    };
                    merged.insert(key.clone(), next);
                }
                Value::Object(merged)
            }
            (Value::Array(parent), Value::Array(child)) => Value::Array(merge_list(parent, child)),
            (_, Value::Null) => self.clone(),
            (_, Value::String(s)) if s.is_empty() => self.clone(),
            _ => Self::adopt(child),
        }
    }

    /// Arrays reachable through objects are stored de-duplicated, the same
    /// shape a later merge with an array parent would produce
    fn adopt(child: &Self) -> Self {
        match child {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), Self::adopt(value)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(merge_list(&[], items)),
            other => other.clone(),
        }
    }
}

/// Scalar rule: the child wins when set
fn merge_option<T: Clone>(parent: &Option<T>, child: &Option<T>) -> Option<T> {
    child.clone().or_else(|| parent.clone())
}

/// Text rule: an empty child never overrides
fn merge_text(parent: &Option<String>, child: &Option<String>) -> Option<String> {
    match child {
        Some(value) if !value.trim().is_empty() => Some(value.clone()),
        _ => parent.clone(),
    }
}

/// Map rule: per-key deep merge
fn merge_map<V: Merge>(
    parent: &BTreeMap<String, V>,
    child: &BTreeMap<String, V>,
) -> BTreeMap<String, V> {
    let mut merged = parent.clone();
    for (key, value) in child {
        let next = match parent.get(key) {
            Some(existing) => existing.merge(value),
            None => V::adopt(value),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// List rule: union without duplicates, parent order first
///
/// Items are compared structurally with a linear scan, so nested values
/// that cannot be hashed are handled too.
pub fn merge_list<T: PartialEq + Clone>(parent: &[T], child: &[T]) -> Vec<T> {
    let mut merged: Vec<T> = Vec::with_capacity(parent.len() + child.len());
    for item in parent.iter().chain(child) {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

/// Merge `child` over `parent`; an absent child yields a copy of the parent
pub fn merge(parent: &Settings, child: Option<&Settings>) -> Settings {
    match child {
        Some(child) => parent.merge(child),
        None => parent.clone(),
    }
}

/// Fold layers left to right, skipping absent ones
pub fn merge_chain<'a, I>(layers: I) -> Result<Settings>
where
    I: IntoIterator<Item = Option<&'a Settings>>,
{
    layers
        .into_iter()
        .flatten()
        .fold(None, |acc: Option<Settings>, layer| {
            Some(match acc {
                Some(merged) => merged.merge(layer),
                None => layer.clone(),
            })
        })
        .ok_or(Error::EmptyMergeChain)
}
