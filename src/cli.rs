use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG;
use crate::orchestrator::Verification;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Provision infrastructure and deploy applications onto it from CI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, env = "DECKHAND_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the pipeline for a CI trigger (apply or destroy)
    Run(RunArgs),

    /// Preview resource changes without touching anything
    Plan {
        /// Preview a destroy instead of an apply
        #[arg(long)]
        destroy: bool,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create or update declared resources
    Apply {
        /// Concurrent resource operations per stage
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Remove every resource in state, dependents first
    Destroy {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Concurrent resource operations per stage
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Show the outputs recorded by the last apply
    Outputs {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build the inventory from recorded outputs
    Inventory {
        /// Read outputs from this file instead of state
        #[arg(long)]
        outputs: Option<PathBuf>,

        /// Write the inventory file to the artifacts directory
        #[arg(short, long)]
        write: bool,
    },

    /// Run the deploy steps against an inventory file
    Deploy {
        /// Inventory file (default: <artifacts_dir>/inventory.ini)
        #[arg(short, long)]
        inventory: Option<PathBuf>,

        /// Targets configured in parallel
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Inspect or repair persisted state
    #[command(subcommand)]
    State(StateCommand),

    /// Validate the configuration without contacting anything
    Check,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Run
// ============================================================================

#[derive(Parser)]
pub struct RunArgs {
    /// Branch or tag that triggered the run
    #[arg(long = "ref", env = "GITHUB_REF_NAME")]
    pub ref_name: Option<String>,

    /// CI event that triggered the run
    #[arg(long, env = "GITHUB_EVENT_NAME")]
    pub event: Option<String>,

    /// Result of the upstream verification job
    #[arg(long, value_enum, env = "DECKHAND_VERIFICATION")]
    pub verification: Option<Verification>,

    /// Concurrent resource operations per stage
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Targets configured in parallel
    #[arg(long)]
    pub deploy_jobs: Option<usize>,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// Show resources, outputs and lock holder
    Show {
        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },

    /// Release a lock left behind by a crashed run
    Unlock {
        /// Lock id, as printed by `state show`
        lock_id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "deckhand",
            "run",
            "--ref",
            "destroy",
            "--event",
            "push",
            "--verification",
            "failure",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.ref_name.as_deref(), Some("destroy"));
                assert_eq!(args.event.as_deref(), Some("push"));
                assert_eq!(args.verification, Some(Verification::Failure));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["deckhand", "plan", "--destroy", "-c", "infra/prod.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("infra/prod.toml"));
        assert!(matches!(cli.command, Command::Plan { destroy: true, json: false }));
    }

    #[test]
    fn test_unknown_verification_rejected() {
        assert!(Cli::try_parse_from(["deckhand", "run", "--verification", "maybe"]).is_err());
    }
}
