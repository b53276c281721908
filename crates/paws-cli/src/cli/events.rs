//! `paws events`: inspect recorded run logs.

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use paws_core::repository::event_store::EventStore;
use paws_types::event::{Event, EventType};
use uuid::Uuid;

use super::run::RunEnv;
use super::store::{self, RunStore};
use super::{Exit, StoreArg};

pub async fn handle_events(
    env: &RunEnv,
    run_id: Option<Uuid>,
    store: Option<StoreArg>,
    json: bool,
) -> Result<Exit> {
    let kind = env.store_kind(store);

    let Some(run_id) = run_id else {
        let runs = store::list_runs(kind, &env.data_dir, &env.config).await?;
        if json {
            let ids: Vec<String> = runs.iter().map(ToString::to_string).collect();
            println!("{}", serde_json::to_string_pretty(&ids)?);
        } else if runs.is_empty() {
            println!("No runs recorded.");
        } else {
            for id in runs {
                println!("{id}");
            }
        }
        return Ok(Exit::Success);
    };

    let store = RunStore::open(kind, &env.data_dir, &env.config, run_id).await?;
    let events = store.read_all().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(Exit::Success);
    }

    if events.is_empty() {
        eprintln!(
            "{} no events recorded for run {run_id}",
            style("error:").red().bold()
        );
        return Ok(Exit::Invalid);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Time"),
            Cell::new("Step"),
            Cell::new("Event"),
            Cell::new("Details"),
        ]);

    for event in &events {
        table.add_row(vec![
            Cell::new(event.seq),
            Cell::new(event.timestamp.format("%H:%M:%S%.3f").to_string()),
            Cell::new(event.step_id.as_deref().unwrap_or("-")),
            Cell::new(event.event_type.as_str()).fg(event_color(event.event_type)),
            Cell::new(details(event)),
        ]);
    }

    println!("{table}");
    Ok(Exit::Success)
}

fn event_color(event_type: EventType) -> Color {
    match event_type {
        EventType::Completed | EventType::RunSucceeded => Color::Green,
        EventType::Failed | EventType::RunAborted => Color::Red,
        EventType::Skipped | EventType::LoopForcedExit => Color::DarkGrey,
        EventType::RunPaused | EventType::RunCancelled => Color::Yellow,
        _ => Color::White,
    }
}

/// One-line summary of the interesting payload fields.
fn details(event: &Event) -> String {
    let p = &event.payload;
    let mut parts = Vec::new();

    if let Some(attempt) = p.attempt {
        parts.push(format!("attempt {attempt}"));
    }
    if let Some(disposition) = p.disposition {
        let name = serde_json::to_value(disposition)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        parts.push(format!("-> {name}"));
    }
    if let Some(target) = &p.fallback_step {
        parts.push(format!("fallback {target}"));
    }
    if let Some(counter) = p.counter {
        parts.push(format!("counter {counter}"));
    }
    if let Some(selected) = &p.selected {
        parts.push(format!("selected [{}]", selected.join(", ")));
    }
    if let Some(outputs) = &p.outputs {
        let keys: Vec<&str> = outputs.keys().map(String::as_str).collect();
        parts.push(format!("outputs [{}]", keys.join(", ")));
    }
    if let Some(error) = p.error.as_ref().or(p.reason.as_ref()) {
        parts.push(truncate(error, 80));
    }
    parts.join("; ")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{head}...")
}
