//! CLI command definitions for the `paws` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod events;
pub mod run;
pub mod store;
pub mod validate;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use paws_types::config::EventStoreKind;
use paws_types::workflow::RunStatus;
use uuid::Uuid;

/// Execute PAWS workflow documents.
#[derive(Parser)]
#[command(name = "paws", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding config.toml and run logs.
    #[arg(long, env = "PAWS_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Write log lines as JSON objects.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info",
            2 => "info,paws_core=debug,paws_infra=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow document from the beginning.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Run id to record events under (default: a new UUID v7).
        #[arg(long)]
        run_id: Option<Uuid>,

        /// Event store backend (default: from config.toml).
        #[arg(long, value_enum)]
        store: Option<StoreArg>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Continue a paused, cancelled or aborted run from its event log.
    Resume {
        /// Path to the (possibly revised) workflow YAML file.
        file: PathBuf,

        /// Run to resume.
        #[arg(long)]
        run_id: Uuid,

        /// Skip the step the run stopped on instead of retrying it.
        #[arg(long)]
        skip_failed: bool,

        #[arg(long, value_enum)]
        store: Option<StoreArg>,

        #[arg(long)]
        json: bool,
    },

    /// Check a workflow document without executing it.
    Validate {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Show the event log of a run, or list runs when no id is given.
    Events {
        #[arg(long)]
        run_id: Option<Uuid>,

        #[arg(long, value_enum)]
        store: Option<StoreArg>,

        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// `--store` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreArg {
    Jsonl,
    Sqlite,
}

impl From<StoreArg> for EventStoreKind {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Jsonl => EventStoreKind::Jsonl,
            StoreArg::Sqlite => EventStoreKind::Sqlite,
        }
    }
}

/// Process exit status of `paws`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    /// Validation, load or parse failure; no step ran.
    Invalid,
    /// Aborted or cancelled during execution.
    Aborted,
    /// Paused awaiting a revised document.
    Paused,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Exit::Success => 0,
            Exit::Invalid => 1,
            Exit::Aborted => 2,
            Exit::Paused => 3,
        }
    }

    pub fn for_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Succeeded => Exit::Success,
            RunStatus::Paused => Exit::Paused,
            RunStatus::Aborted | RunStatus::Cancelled | RunStatus::Running => Exit::Aborted,
        }
    }
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Exit::for_status(RunStatus::Succeeded).code(), 0);
        assert_eq!(Exit::Invalid.code(), 1);
        assert_eq!(Exit::for_status(RunStatus::Aborted).code(), 2);
        assert_eq!(Exit::for_status(RunStatus::Cancelled).code(), 2);
        assert_eq!(Exit::for_status(RunStatus::Paused).code(), 3);
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "paws", "-vv", "run", "plan.yaml", "--store", "sqlite", "--json",
        ])
        .unwrap();
        assert_eq!(cli.log_directive(), "info,paws_core=debug,paws_infra=debug");
        match cli.command {
            Commands::Run { file, store, json, run_id } => {
                assert_eq!(file, PathBuf::from("plan.yaml"));
                assert_eq!(store, Some(StoreArg::Sqlite));
                assert!(json);
                assert!(run_id.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_resume_requires_run_id() {
        assert!(Cli::try_parse_from(["paws", "resume", "plan.yaml"]).is_err());
        let id = Uuid::now_v7().to_string();
        let cli =
            Cli::try_parse_from(["paws", "resume", "plan.yaml", "--run-id", &id, "--skip-failed"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Resume { skip_failed: true, .. }));
    }

    #[test]
    fn test_quiet_filter() {
        let cli = Cli::try_parse_from(["paws", "-q", "validate", "plan.yaml"]).unwrap();
        assert_eq!(cli.log_directive(), "error");
    }
}
