use crate::Context;
use crate::config::{self, FileSourceLoader};
use crate::deploy::ShellAppExecutor;
use crate::runner::ShellRunner;
use crate::ui;
use anyhow::Result;
use rollout::{Collaborators, Engine, Phase, PhaseBody};
use std::path::Path;

/// Validate a plan and print how it would be dispatched
pub fn run(ctx: &Context, path: &Path) -> Result<()> {
    let plan = super::load_layered(path, None)?;
    let runner = ShellRunner;
    let apps = ShellAppExecutor::new(&runner);
    let loader = FileSourceLoader;
    let engine = Engine::new(plan, config::plan_root(path), Collaborators::new(&apps, &loader))?;

    let settings = engine.effective_settings(None);
    let config = engine.config();

    ui::header(&format!("Plan {}", path.display()));
    if let Some(description) = &config.description {
        ui::dim(description);
    }
    ui::kv("namespace", settings.namespace());
    ui::kv("on_failure", &format!("{:?}", settings.on_failure()).to_lowercase());
    ui::kv("rollback_scope", &format!("{:?}", settings.rollback_scope()).to_lowercase());
    ui::kv("parallel", &settings.parallel().to_string());
    ui::kv("max_workers", &settings.max_workers().to_string());

    if !config.apps.is_empty() {
        println!();
        let names: Vec<&str> = config.apps.iter().map(|a| a.name.as_str()).collect();
        println!("  apps: {}", names.join(" → "));
    }

    if ctx.verbose > 0 || settings.parallel() {
        for (i, wave) in engine.phase_waves().iter().enumerate() {
            println!();
            println!("  wave {}", i + 1);
            for phase in wave {
                print_phase(phase);
            }
        }
    } else {
        println!();
        for phase in engine.ordered_phases() {
            print_phase(phase);
        }
    }

    println!();
    ui::success(&format!(
        "{} phases, {} apps declared",
        config.phases.len(),
        config.declared_apps()
    ));
    Ok(())
}

fn print_phase(phase: &Phase) {
    let detail = match &phase.body {
        PhaseBody::Source(source) => format!("source {}", source.display()),
        PhaseBody::Apps(apps) => apps
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    };
    let after = if phase.depends_on.is_empty() {
        String::new()
    } else {
        format!(" (after {})", phase.depends_on.join(", "))
    };
    println!("    {}{}: {}", phase.name, after, detail);
}
