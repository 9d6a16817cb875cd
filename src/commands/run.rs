use crate::Context;
use crate::cli::RunArgs;
use crate::config::{self, FileSourceLoader};
use crate::deploy::ShellAppExecutor;
use crate::runner::{KubectlApplier, ShellRunner};
use crate::ui;
use anyhow::{Result, bail};
use rollout::{Collaborators, Engine, ExecutionResult};
use taskhooks::HookExecutor;

/// Execute a plan and report the result tree
pub fn run(ctx: &Context, args: &RunArgs) -> Result<()> {
    let overrides = args.overrides();
    let plan = super::load_layered(&args.plan, Some(&overrides))?;
    let root = plan.settings.clone().unwrap_or_default();

    let runner = ShellRunner;
    let applier = KubectlApplier::new(&runner, root.timeout())
        .with_kubeconfig(root.kubeconfig.clone())
        .with_context(root.kube_context.clone());
    let hooks = HookExecutor::new(&runner, &applier);
    let apps = ShellAppExecutor::new(&runner);
    let loader = FileSourceLoader;
    let collab = Collaborators::new(&apps, &loader).with_hooks(&hooks);

    let engine = Engine::new(plan, config::plan_root(&args.plan), collab)?;
    if !ctx.quiet && !args.json {
        ui::info(&format!(
            "Deploying {} ({} phases) into {}",
            args.plan.display(),
            engine.config().phases.len(),
            root.namespace()
        ));
    }

    let result = engine.execute(None);
    render(ctx, args, &result)?;

    if !result.is_success() {
        bail!(
            "Deployment failed: {}/{} apps succeeded",
            result.successful_apps(),
            result.total_apps()
        );
    }
    Ok(())
}

fn render(ctx: &Context, args: &RunArgs, result: &ExecutionResult) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if !ctx.quiet || !result.is_success() {
        ui::report(result);
    }
    Ok(())
}
