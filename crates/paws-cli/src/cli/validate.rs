//! `paws validate`: structural checks without execution.

use std::path::Path;

use anyhow::Result;
use console::style;
use paws_core::workflow::document::load_document_file;
use paws_core::workflow::validator::{validate, ValidationReport};
use paws_infra::extension::registry::ExtensionRegistry;

use super::run::RunEnv;
use super::Exit;

pub async fn handle_validate(env: &RunEnv, file: &Path, json: bool) -> Result<Exit> {
    let doc = match load_document_file(file) {
        Ok(doc) => doc,
        Err(e) => {
            if json {
                let out = serde_json::json!({
                    "valid": false,
                    "violations": [e.to_string()],
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                eprintln!("{} {}: {e}", style("error:").red().bold(), file.display());
            }
            return Ok(Exit::Invalid);
        }
    };

    let registry = ExtensionRegistry::with_builtins(&env.config);
    let report = validate(&doc, &registry);
    if report.is_valid() && !json {
        if !env.quiet {
            println!(
                "{} {} ({} steps)",
                style("✓").green().bold(),
                file.display(),
                doc.steps.len()
            );
        }
        return Ok(Exit::Success);
    }

    print_report(file, &report, json)?;
    Ok(if report.is_valid() {
        Exit::Success
    } else {
        Exit::Invalid
    })
}

/// Print a validation report, to stdout as JSON or to stderr as a list.
pub fn print_report(file: &Path, report: &ValidationReport, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "valid": report.is_valid(),
            "violations": report
                .violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    eprintln!(
        "{} {} has {} violation(s):",
        style("error:").red().bold(),
        file.display(),
        report.violations.len()
    );
    for violation in &report.violations {
        eprintln!("  {} {violation}", style("-").dim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paws_types::config::PawsConfig;

    fn env() -> RunEnv {
        RunEnv {
            data_dir: std::env::temp_dir(),
            config: PawsConfig::default(),
            quiet: true,
        }
    }

    #[tokio::test]
    async fn test_validate_accepts_shell_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ok.yaml");
        std::fs::write(
            &path,
            "provider: { name: x }\nuser_inputs: { prompt: p }\nsteps:\n  - { id: a, extension: Bash, inputs: { command: ls } }\n",
        )
        .unwrap();
        assert_eq!(handle_validate(&env(), &path, false).await.unwrap(), Exit::Success);
    }

    #[tokio::test]
    async fn test_validate_rejects_forward_reference() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.yaml");
        std::fs::write(
            &path,
            "provider: { name: x }\nuser_inputs: { prompt: p }\nsteps:\n  - { id: a, extension: Bash, inputs: { command: '{{b.stdout}}' } }\n  - { id: b, extension: Bash, inputs: { command: ls } }\n",
        )
        .unwrap();
        assert_eq!(handle_validate(&env(), &path, true).await.unwrap(), Exit::Invalid);
    }

    #[tokio::test]
    async fn test_validate_unparseable_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.yaml");
        std::fs::write(&path, "steps: [[[").unwrap();
        assert_eq!(handle_validate(&env(), &path, false).await.unwrap(), Exit::Invalid);
    }
}
