//! # rollout
//!
//! Phased deployment engine: apps grouped into dependency-ordered phases,
//! run sequentially or in parallel waves, with layered settings and a
//! scoped rollback policy.
//!
//! ## Architecture
//!
//! - **Settings**: every scope (plan, phase, nested document, app) layers its
//!   own [`Settings`] over its parent's via [`merge`]
//! - **Graph**: phases are ordered with Kahn's algorithm; parallel runs
//!   dispatch [`graph::ready_wave`]s
//! - **Engine**: [`Engine`] runs a [`PlanConfig`] through injected
//!   [`Collaborators`], recursing into `source` phases
//! - **Results**: an [`ExecutionResult`] tree mirrors the plan, with one
//!   status per app and phase
//!
//! ## Failure policy
//!
//! | `on_failure` | effect |
//! |---|---|
//! | `stop` | no further apps or phases are dispatched |
//! | `continue` | everything runs; the run is still reported failed |
//! | `rollback` | stop, then undo per `rollback_scope` (`app`, `phase`, `all`) |
//!
//! ## Example
//!
//! ```ignore
//! use rollout::{App, Collaborators, Engine, NoSources, PlanConfig};
//!
//! let plan = PlanConfig {
//!     apps: vec![App::command("api", "./deploy.sh api")],
//!     ..Default::default()
//! };
//! let engine = Engine::new(plan, ".", Collaborators::new(&executor, &NoSources))?;
//! let result = engine.execute(None);
//! println!("{}: {}/{}", result.status, result.successful_apps(), result.total_apps());
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod plan;
pub mod result;
pub mod rollback;
pub mod settings;

pub use context::{AppExecution, AppExecutor, Collaborators, NoSources, SourceLoader};
pub use engine::{Engine, MAX_SOURCE_DEPTH};
pub use error::{Error, GraphError, Result};
pub use plan::{App, AppSpec, Phase, PhaseBody, PlanConfig};
pub use result::{AppKey, AppResult, ExecutionResult, ExecutionStatus, PhaseResult};
pub use rollback::{LedgerEntry, RollbackLedger};
pub use settings::{
    ExecutionOrder, Merge, OnFailure, RepoCredential, RollbackScope, Settings, merge,
    merge_chain,
};
