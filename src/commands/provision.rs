//! Resource commands: plan, apply, destroy, outputs

use anyhow::{Context as _, Result};
use colored::Colorize;
use provision::state;
use provision::{Engine, Mode, OutputSet, Plan, Reconciliation};

use crate::Context;
use crate::commands::{Setup, confirm};
use crate::extract;
use crate::progress::ReconcileProgress;
use crate::ui;

pub fn plan(ctx: &Context, destroy: bool, json: bool) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let vars = setup.vars()?;
    let provider = setup.provider()?;
    let engine = Engine::new(&provider, setup.backend.as_ref(), setup.state_id.clone());

    let mode = if destroy { Mode::Destroy } else { Mode::Apply };
    let plan = engine.plan(&setup.config.resources, mode, &vars)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    print_plan(&plan);
    Ok(())
}

pub fn apply(ctx: &Context, jobs: Option<usize>) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let reconciliation = reconcile(ctx, &setup, Mode::Apply, jobs)?;

    let path = setup.config.outputs_path();
    extract::write_outputs(&path, &reconciliation.outputs)?;
    print_outputs(&reconciliation.outputs);
    ui::dim(&format!("Outputs written to {}", path.display()));
    Ok(())
}

pub fn destroy(ctx: &Context, yes: bool, jobs: Option<usize>) -> Result<()> {
    let setup = Setup::load(ctx)?;

    let in_state = state::load(setup.backend.as_ref(), &setup.state_id)?
        .map_or(0, |state| state.resources.len());
    if in_state == 0 {
        ui::info("No resources in state, nothing to destroy");
        return Ok(());
    }

    ui::warn(&format!(
        "This will delete {} resources recorded under '{}'",
        in_state, setup.state_id
    ));
    if !confirm("Destroy all resources?", yes)? {
        ui::info("Cancelled");
        return Ok(());
    }

    reconcile(ctx, &setup, Mode::Destroy, jobs)?;
    Ok(())
}

pub fn outputs(ctx: &Context, json: bool) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let state = state::load(setup.backend.as_ref(), &setup.state_id).context("Failed to read state")?;
    let outputs = state.map(|s| s.outputs).unwrap_or_default();

    if json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    } else if outputs.is_empty() {
        ui::info("No outputs recorded");
    } else {
        print_outputs(&outputs);
    }
    Ok(())
}

fn reconcile(ctx: &Context, setup: &Setup, mode: Mode, jobs: Option<usize>) -> Result<Reconciliation> {
    let vars = setup.vars()?;
    let provider = setup.provider()?;
    let engine = Engine::new(&provider, setup.backend.as_ref(), setup.state_id.clone())
        .with_options(setup.reconcile_options(jobs));

    ui::header(&format!("deckhand {mode}"));
    let mut progress = ReconcileProgress::new(ctx.quiet);
    let reconciliation = engine.reconcile_with_progress(&setup.config.resources, mode, &vars, &mut progress)?;

    let s = &reconciliation.summary;
    println!();
    if s.has_changes() {
        ui::success(&format!(
            "{} created, {} updated, {} deleted, {} unchanged (serial {})",
            s.created, s.updated, s.deleted, s.unchanged, reconciliation.serial
        ));
    } else {
        ui::success("No changes, infrastructure is up to date");
    }
    Ok(reconciliation)
}

fn print_plan(plan: &Plan) {
    ui::header(&format!("Plan: {}", plan.mode));

    if !plan.has_changes() {
        ui::success("No changes, infrastructure is up to date");
        return;
    }

    for change in plan.pending() {
        println!(
            "  {} {} {}",
            ui::action_symbol(change.action),
            change.address.to_string().bold(),
            format!("(stage {})", change.stage + 1).dimmed()
        );
        for attribute in &change.changes {
            ui::attribute_change(attribute);
        }
    }

    let s = plan.summary();
    println!();
    ui::info(&format!(
        "{} to create, {} to update, {} to delete, {} unchanged",
        s.created.to_string().green(),
        s.updated.to_string().yellow(),
        s.deleted.to_string().red(),
        s.unchanged
    ));
}

fn print_outputs(outputs: &OutputSet) {
    ui::section("Outputs");
    for (name, value) in outputs {
        ui::kv(name, &value.to_string());
    }
}
