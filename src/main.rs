mod cli;
mod commands;
mod config;
mod extract;
mod inventory;
mod orchestrator;
mod progress;
mod template;
mod ui;
mod vars;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Pipeline configuration file
    pub config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
    };

    match cli.command {
        Command::Run(args) => commands::pipeline::run(&ctx, args),
        Command::Plan { destroy, json } => commands::provision::plan(&ctx, destroy, json),
        Command::Apply { jobs } => commands::provision::apply(&ctx, jobs),
        Command::Destroy { yes, jobs } => commands::provision::destroy(&ctx, yes, jobs),
        Command::Outputs { json } => commands::provision::outputs(&ctx, json),
        Command::Inventory { outputs, write } => {
            commands::deploy::inventory(&ctx, outputs.as_deref(), write)
        }
        Command::Deploy { inventory, jobs } => {
            commands::deploy::deploy(&ctx, inventory.as_deref(), jobs)
        }
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::Check => commands::check::run(&ctx),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "deckhand", &mut io::stdout());
            Ok(())
        }
    }
}
