//! `paws run` and `paws resume`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use paws_core::workflow::document::load_document_file;
use paws_core::workflow::engine::{
    EngineError, ResumeInstruction, RunOutcome, RunReport, WorkflowEngine,
};
use paws_infra::config;
use paws_infra::extension::registry::ExtensionRegistry;
use paws_types::config::{EventStoreKind, PawsConfig};
use paws_types::workflow::WorkflowDocument;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::store::RunStore;
use super::validate::print_report;
use super::{Exit, StoreArg};

/// Settings shared by every command that touches a run.
pub struct RunEnv {
    pub data_dir: PathBuf,
    pub config: PawsConfig,
    pub quiet: bool,
}

impl RunEnv {
    pub fn store_kind(&self, arg: Option<StoreArg>) -> EventStoreKind {
        arg.map(Into::into).unwrap_or(self.config.event_store)
    }
}

enum Mode {
    Start,
    Resume(ResumeInstruction),
}

/// Execute `file` from the beginning.
pub async fn handle_run(
    env: &RunEnv,
    file: &Path,
    run_id: Option<Uuid>,
    store: Option<StoreArg>,
    json: bool,
) -> Result<Exit> {
    let run_id = run_id.unwrap_or_else(Uuid::now_v7);
    execute(env, file, run_id, store, json, Mode::Start).await
}

/// Continue `run_id` with the document in `file`.
pub async fn handle_resume(
    env: &RunEnv,
    file: &Path,
    run_id: Uuid,
    skip_failed: bool,
    store: Option<StoreArg>,
    json: bool,
) -> Result<Exit> {
    let instruction = if skip_failed {
        ResumeInstruction::SkipFailedStep
    } else {
        ResumeInstruction::RetryFailedStep
    };
    execute(env, file, run_id, store, json, Mode::Resume(instruction)).await
}

async fn execute(
    env: &RunEnv,
    file: &Path,
    run_id: Uuid,
    store: Option<StoreArg>,
    json: bool,
    mode: Mode,
) -> Result<Exit> {
    let doc = match load_document_file(file) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("{} {}: {e}", style("error:").red().bold(), file.display());
            return Ok(Exit::Invalid);
        }
    };

    let kind = env.store_kind(store);
    let store = RunStore::open(kind, &env.data_dir, &env.config, run_id).await?;
    let location = store.location(&env.data_dir, &env.config);

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let engine = WorkflowEngine::new(ExtensionRegistry::with_builtins(&env.config), store)
        .with_cancellation(cancel)
        .with_default_timeout(Duration::from_secs(env.config.default_step_timeout_secs));

    let result = match mode {
        Mode::Start => engine.start_with_id(&doc, run_id).await,
        Mode::Resume(instruction) => engine.resume(&doc, instruction).await,
    };

    let report = match result {
        Ok(report) => report,
        Err(EngineError::InvalidDocument(report)) => {
            print_report(file, &report, json)?;
            return Ok(Exit::Invalid);
        }
        Err(EngineError::NothingToResume) => {
            eprintln!(
                "{} no events recorded for run {run_id} in {location}",
                style("error:").red().bold()
            );
            return Ok(Exit::Invalid);
        }
        Err(e) => return Err(e).context("Workflow execution failed"),
    };

    print_run_report(&doc, &report, &location, json, env.quiet)?;
    Ok(Exit::for_status(report.outcome.status()))
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next step boundary");
            cancel.cancel();
        }
    });
}

/// JSON form of a run report.
pub fn report_json(report: &RunReport) -> serde_json::Value {
    let mut out = serde_json::json!({
        "run_id": report.run_id.to_string(),
        "status": report.outcome.status().as_str(),
        "context": report.context.to_json(),
    });
    match &report.outcome {
        RunOutcome::Aborted { step_id, error } => {
            out["failed_step"] = serde_json::json!(step_id);
            out["error"] = serde_json::json!(error);
        }
        RunOutcome::Paused(request) => {
            out["self_heal_request"] = serde_json::to_value(request.as_ref())
                .unwrap_or(serde_json::Value::Null);
        }
        RunOutcome::Succeeded | RunOutcome::Cancelled => {}
    }
    out
}

fn print_run_report(
    doc: &WorkflowDocument,
    report: &RunReport,
    location: &str,
    json: bool,
    quiet: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(report))?);
        return Ok(());
    }

    // The self-heal request is the hand-off to the planner; print it even
    // when quiet.
    if let RunOutcome::Paused(request) = &report.outcome {
        println!("{}", serde_json::to_string_pretty(request.as_ref())?);
    }
    if quiet {
        return Ok(());
    }

    let run = report.run_id.to_string();
    let completed = report.context.completed_steps().len();
    println!();
    match &report.outcome {
        RunOutcome::Succeeded => println!(
            "  {} Run {} succeeded ({completed} of {} steps produced outputs)",
            style("✓").green().bold(),
            style(&run).cyan(),
            doc.steps.len()
        ),
        RunOutcome::Aborted { step_id, error } => println!(
            "  {} Run {} aborted at step '{}': {error}",
            style("✗").red().bold(),
            style(&run).cyan(),
            step_id.as_deref().unwrap_or("-")
        ),
        RunOutcome::Cancelled => println!(
            "  {} Run {} cancelled; resume with `paws resume --run-id {run}`",
            style("!").yellow().bold(),
            style(&run).cyan()
        ),
        RunOutcome::Paused(request) => println!(
            "  {} Run {} paused for self-heal at step '{}'",
            style("⏸").yellow().bold(),
            style(&run).cyan(),
            request.failed_step.id
        ),
    }
    println!("  Events: {}", style(location).dim());
    println!();
    Ok(())
}

/// Resolve the data directory and load its config.
pub async fn load_env(data_dir: Option<PathBuf>, quiet: bool) -> RunEnv {
    let data_dir = config::resolve_data_dir(data_dir);
    let config = config::load_config(&data_dir).await;
    RunEnv {
        data_dir,
        config,
        quiet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paws_types::event::EventType;
    use paws_core::repository::event_store::EventStore;

    const PLAN: &str = r#"
provider: { name: Localhost }
user_inputs: { prompt: say hello }
steps:
  - id: greet
    description: Print a greeting
    extension: Bash
    tool: execute_command
    inputs: { command: "echo hello" }
    outputs: { stdout: greeting }
  - id: shout
    description: Upper-case it
    extension: Bash
    inputs: { command: "echo {{greet.stdout}} | tr a-z A-Z" }
"#;

    async fn env(tmp: &Path) -> RunEnv {
        load_env(Some(tmp.to_path_buf()), true).await
    }

    fn write_plan(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("plan.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_run_succeeds_with_shell_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path()).await;
        let plan = write_plan(tmp.path(), PLAN);
        let run_id = Uuid::now_v7();

        let exit = handle_run(&env, &plan, Some(run_id), None, true).await.unwrap();
        assert_eq!(exit, Exit::Success);

        let store = RunStore::open(EventStoreKind::Jsonl, tmp.path(), &env.config, run_id)
            .await
            .unwrap();
        let events = store.read_all().await.unwrap();
        let shout = events
            .iter()
            .find(|e| e.event_type == EventType::Completed && e.step_id.as_deref() == Some("shout"))
            .unwrap();
        assert_eq!(shout.payload.outputs.as_ref().unwrap()["stdout"], "HELLO");
    }

    #[tokio::test]
    async fn test_invalid_document_exits_one() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path()).await;
        let plan = write_plan(
            tmp.path(),
            "provider: { name: x }\nuser_inputs: { prompt: p }\nsteps:\n  - { id: a, extension: Python }\n",
        );
        assert_eq!(handle_run(&env, &plan, None, None, true).await.unwrap(), Exit::Invalid);

        let missing = tmp.path().join("missing.yaml");
        assert_eq!(handle_run(&env, &missing, None, None, true).await.unwrap(), Exit::Invalid);
    }

    #[tokio::test]
    async fn test_abort_exits_two_and_self_heal_exits_three() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path()).await;

        let plan = write_plan(
            tmp.path(),
            "provider: { name: x }\nuser_inputs: { prompt: p }\nsteps:\n  - { id: a, extension: Bash, inputs: { command: 'exit 1' } }\n",
        );
        assert_eq!(handle_run(&env, &plan, None, Some(StoreArg::Sqlite), true).await.unwrap(), Exit::Aborted);

        let plan = write_plan(
            tmp.path(),
            "provider: { name: x }\nuser_inputs: { prompt: p }\nsteps:\n  - { id: a, extension: Bash, inputs: { command: 'exit 1' }, on_failure: { strategy: self_heal } }\n",
        );
        let run_id = Uuid::now_v7();
        assert_eq!(handle_run(&env, &plan, Some(run_id), None, true).await.unwrap(), Exit::Paused);

        // Revised plan: the failing command is fixed.
        let plan = write_plan(
            tmp.path(),
            "provider: { name: x }\nuser_inputs: { prompt: p }\nsteps:\n  - { id: a, extension: Bash, inputs: { command: 'echo fixed' } }\n",
        );
        assert_eq!(
            handle_resume(&env, &plan, run_id, false, None, true).await.unwrap(),
            Exit::Success
        );
    }

    #[tokio::test]
    async fn test_resume_unknown_run_exits_one() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env(tmp.path()).await;
        let plan = write_plan(tmp.path(), PLAN);
        let exit = handle_resume(&env, &plan, Uuid::now_v7(), false, None, true).await.unwrap();
        assert_eq!(exit, Exit::Invalid);
    }

    #[test]
    fn test_store_kind_prefers_flag() {
        let env = RunEnv {
            data_dir: PathBuf::from("/tmp"),
            config: PawsConfig::default(),
            quiet: true,
        };
        assert_eq!(env.store_kind(None), EventStoreKind::Jsonl);
        assert_eq!(env.store_kind(Some(StoreArg::Sqlite)), EventStoreKind::Sqlite);
    }
}
