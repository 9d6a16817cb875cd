pub mod plan;
pub mod run;

use crate::config;
use anyhow::{Context, Result};
use rollout::{PlanConfig, Settings, merge_chain};
use std::path::Path;

/// Load a plan and layer its root settings: user defaults, plan, overrides
pub fn load_layered(path: &Path, overrides: Option<&Settings>) -> Result<PlanConfig> {
    let user = config::load_user_settings()?;
    let mut plan = config::load_plan(path)?;

    let layers = [user.as_ref(), plan.settings.as_ref(), overrides];
    if layers.iter().any(Option::is_some) {
        plan.settings = Some(merge_chain(layers).context("Could not merge settings layers")?);
    }
    Ok(plan)
}
