mod cli;
mod commands;
mod error;
mod health;
mod import;
mod mapping;
mod model;
mod scheduler;
mod service;
mod source;
mod store;
#[cfg(test)]
mod testing;
mod util;
mod validator;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Configure(args) => commands::configure::run(args),
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Import(args) => commands::import::run(args),
        Commands::Progress(args) => commands::run_state::progress(args),
        Commands::Cancel(args) => commands::run_state::cancel(args),
        Commands::Reset(args) => commands::run_state::reset(args),
        Commands::Schedule(args) => commands::schedule::schedule(args),
        Commands::Unschedule(args) => commands::schedule::unschedule(args),
        Commands::SchedulerStatus(args) => commands::schedule::status(args),
        Commands::SchedulerTest(args) => commands::schedule::self_test(args),
        Commands::SchedulerDebug(args) => commands::schedule::debug(args),
        Commands::Health(args) => commands::run_state::health(args),
        Commands::Tick(args) => commands::schedule::tick(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
