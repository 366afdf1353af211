//! State inspection and lock repair

use anyhow::{Context as _, Result};
use colored::Colorize;
use provision::state;

use crate::Context;
use crate::cli::StateCommand;
use crate::commands::{Setup, confirm};
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    match cmd {
        StateCommand::Show { json } => show(ctx, json),
        StateCommand::Unlock { lock_id, yes } => unlock(ctx, &lock_id, yes),
    }
}

fn show(ctx: &Context, json: bool) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let state = state::load(setup.backend.as_ref(), &setup.state_id).context("Failed to read state")?;
    let lock = setup.backend.lock_info(&setup.state_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    ui::header(&format!("State: {}", setup.state_id));
    match &lock {
        Some(info) => ui::kv("Lock", &format!("{} {info}", "held by".yellow())),
        None => ui::kv("Lock", "free"),
    }

    let Some(state) = state else {
        ui::info("No state recorded yet");
        return Ok(());
    };

    ui::kv("Serial", &state.serial.to_string());
    ui::kv("Lineage", &state.lineage);
    if let Some(updated) = state.updated_at {
        ui::kv("Updated", &updated.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }

    ui::section(&format!("Resources ({})", state.resources.len()));
    for (address, live) in &state.resources {
        let id = live
            .attributes
            .get("id")
            .map(provision::types::json_text)
            .unwrap_or_default();
        println!("  {} {}", address.to_string().bold(), id.dimmed());
        if !live.depends_on.is_empty() {
            let deps: Vec<String> = live.depends_on.iter().map(ToString::to_string).collect();
            ui::dim(&format!("  depends on {}", deps.join(", ")));
        }
    }

    if !state.outputs.is_empty() {
        ui::section("Outputs");
        for (name, value) in &state.outputs {
            ui::kv(name, &value.to_string());
        }
    }
    Ok(())
}

fn unlock(ctx: &Context, lock_id: &str, yes: bool) -> Result<()> {
    let setup = Setup::load(ctx)?;

    match setup.backend.lock_info(&setup.state_id)? {
        None => {
            ui::info(&format!("State '{}' is not locked", setup.state_id));
            return Ok(());
        }
        Some(info) => ui::warn(&format!("Lock held by {info}")),
    }

    if !confirm("Release this lock? Only do this if the holder is gone", yes)? {
        ui::info("Cancelled");
        return Ok(());
    }

    match state::force_unlock(setup.backend.as_ref(), &setup.state_id, lock_id)
        .with_context(|| format!("Failed to release lock {lock_id}"))?
    {
        Some(_) => ui::success("Lock released"),
        None => ui::info("The lock was released in the meantime"),
    }
    Ok(())
}
