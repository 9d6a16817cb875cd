use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rollout::{OnFailure, RollbackScope, Settings};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stagecraft")]
#[command(version)]
#[command(about = "Phased, dependency-ordered deployments with rollback", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a deployment plan
    Run(RunArgs),

    /// Validate a plan and show its phase order
    Plan {
        /// Plan file (.toml or .json)
        plan: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OnFailureArg {
    Stop,
    Continue,
    Rollback,
}

impl From<OnFailureArg> for OnFailure {
    fn from(arg: OnFailureArg) -> Self {
        match arg {
            OnFailureArg::Stop => Self::Stop,
            OnFailureArg::Continue => Self::Continue,
            OnFailureArg::Rollback => Self::Rollback,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RollbackScopeArg {
    App,
    Phase,
    All,
}

impl From<RollbackScopeArg> for RollbackScope {
    fn from(arg: RollbackScopeArg) -> Self {
        match arg {
            RollbackScopeArg::App => Self::App,
            RollbackScopeArg::Phase => Self::Phase,
            RollbackScopeArg::All => Self::All,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Plan file (.toml or .json)
    pub plan: PathBuf,

    /// Run independent phases concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Run the apps of each set concurrently
    #[arg(long)]
    pub parallel_apps: bool,

    /// Worker threads per concurrent batch
    #[arg(short = 'j', long)]
    pub max_workers: Option<usize>,

    /// What to do when an app or phase fails
    #[arg(long, value_enum)]
    pub on_failure: Option<OnFailureArg>,

    /// What a rollback undoes
    #[arg(long, value_enum)]
    pub rollback_scope: Option<RollbackScopeArg>,

    /// Default namespace for apps
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Kubeconfig passed to kubectl and hooks
    #[arg(long, env = "STAGECRAFT_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Per-command timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the result tree as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Settings layer from command-line flags; unset flags leave the plan alone
    pub fn overrides(&self) -> Settings {
        Settings {
            parallel: self.parallel.then_some(true),
            parallel_apps: self.parallel_apps.then_some(true),
            max_workers: self.max_workers,
            on_failure: self.on_failure.map(Into::into),
            rollback_scope: self.rollback_scope.map(Into::into),
            namespace: self.namespace.clone(),
            kubeconfig: self.kubeconfig.clone(),
            timeout: self.timeout,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::try_parse_from([
            "stagecraft",
            "run",
            "plan.toml",
            "--parallel",
            "-j",
            "8",
            "--on-failure",
            "rollback",
            "--rollback-scope",
            "phase",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let settings = args.overrides();
        assert_eq!(settings.parallel, Some(true));
        assert_eq!(settings.parallel_apps, None);
        assert_eq!(settings.max_workers, Some(8));
        assert_eq!(settings.on_failure, Some(OnFailure::Rollback));
        assert_eq!(settings.rollback_scope, Some(RollbackScope::Phase));
        assert_eq!(settings.namespace, None);
    }

    #[test]
    fn test_global_verbosity() {
        let cli = Cli::try_parse_from(["stagecraft", "plan", "plan.toml", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }
}
