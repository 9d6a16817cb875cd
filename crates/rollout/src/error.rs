//! Error types for plan construction

use std::path::PathBuf;
use thiserror::Error;

/// Problems with a dependency graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate name '{0}'")]
    DuplicateNode(String),

    #[error("'{node}' depends on unknown '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Configuration errors, raised before anything executes
#[derive(Error, Debug)]
pub enum Error {
    #[error("merge chain has no settings")]
    EmptyMergeChain,

    #[error("invalid phase '{phase}': {reason}")]
    InvalidPhase { phase: String, reason: String },

    #[error("duplicate app '{0}'")]
    DuplicateApp(String),

    #[error("dependency graph: {0}")]
    Graph(#[from] GraphError),

    #[error("failed to load source {}: {source}", path.display())]
    SourceLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("source {} nested more than {max} levels deep", path.display())]
    NestingTooDeep { path: PathBuf, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
