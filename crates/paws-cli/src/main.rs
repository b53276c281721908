//! PAWS workflow executor entry point.
//!
//! Binary name: `paws`
//!
//! Parses CLI arguments, loads config from the data directory, initializes
//! tracing, then dispatches to the command handler. The process exit code
//! reflects the run outcome: 0 succeeded, 1 invalid document, 2 aborted or
//! cancelled, 3 paused for self-heal.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use console::style;
use paws_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};

use cli::{Cli, Commands, Exit};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Shell completions don't need config or tracing
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "paws", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let env = cli::run::load_env(cli.data_dir.clone(), cli.quiet).await;

    let tracing_options = TracingOptions::new(cli.log_directive())
        .with_json(cli.log_json || env.config.log_json)
        .with_otel(cli.otel || env.config.otel);
    if let Err(e) = init_tracing(&tracing_options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = match cli.command {
        Commands::Run {
            file,
            run_id,
            store,
            json,
        } => cli::run::handle_run(&env, &file, run_id, store, json).await,

        Commands::Resume {
            file,
            run_id,
            skip_failed,
            store,
            json,
        } => cli::run::handle_resume(&env, &file, run_id, skip_failed, store, json).await,

        Commands::Validate { file, json } => {
            cli::validate::handle_validate(&env, &file, json).await
        }

        Commands::Events {
            run_id,
            store,
            json,
        } => cli::events::handle_events(&env, run_id, store, json).await,

        Commands::Completions { .. } => Ok(Exit::Success),
    };

    shutdown_tracing();

    match result {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            Exit::Aborted.into()
        }
    }
}
