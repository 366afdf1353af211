//! Configuration-phase commands: inventory, deploy

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use provision::OutputSet;
use provision::state;
use remote::{ExecuteOptions, Executor};
use std::path::Path;

use crate::Context;
use crate::commands::Setup;
use crate::extract::{self, ExtractedValues};
use crate::inventory;
use crate::progress::DeployProgress;
use crate::template::TemplateContext;
use crate::ui;

/// Outputs from a file, or from state when no file is given
fn load_outputs(setup: &Setup, file: Option<&Path>) -> Result<OutputSet> {
    if let Some(path) = file {
        return Ok(extract::read_outputs(path)?);
    }
    let state = state::load(setup.backend.as_ref(), &setup.state_id).context("Failed to read state")?;
    match state {
        Some(state) => Ok(state.outputs),
        None => bail!("No state recorded under '{}'; run apply first", setup.state_id),
    }
}

pub fn inventory(ctx: &Context, outputs: Option<&Path>, write: bool) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let outputs = load_outputs(&setup, outputs)?;
    let values = extract::extract(&outputs, &setup.config.outputs)?;
    let records = inventory::build(&values, &setup.config.connection)?;

    if write {
        let path = setup.config.inventory_path();
        inventory::write(&path, &records)?;
        ui::success(&format!("Wrote {} targets to {}", records.len(), path.display()));
    } else {
        print!("{}", inventory::render(&records));
    }
    Ok(())
}

pub fn deploy(ctx: &Context, inventory_file: Option<&Path>, jobs: Option<usize>) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let vars = setup.vars()?;

    let path = inventory_file.map_or_else(|| setup.config.inventory_path(), Path::to_path_buf);
    let mut records = inventory::read(&path)
        .with_context(|| format!("Failed to load inventory {}", path.display()))?;

    // Templates may reference outputs; use the last written outputs file
    let outputs_path = setup.config.outputs_path();
    let values = if outputs_path.exists() {
        extract::extract(&extract::read_outputs(&outputs_path)?, &setup.config.outputs)?
    } else {
        log::debug!("No outputs file at {}", outputs_path.display());
        ExtractedValues::default()
    };

    let context = TemplateContext {
        outputs: &values,
        vars: &vars,
    };
    let steps = context.render_steps(&setup.config.deploy.steps)?;

    // A key from the configuration or environment replaces the path in the file
    let credential = setup.key_source().open().context("Failed to prepare SSH credential")?;
    if let Some(credential) = &credential {
        for record in &mut records {
            record.key_file = Some(credential.path().to_path_buf());
        }
    }

    ui::header(&format!("Deploying to {} targets", records.len()));
    let transport = setup.transport();
    let observer = DeployProgress::new(steps.len(), ctx.quiet);
    let report = Executor::new(&transport)
        .with_options(ExecuteOptions {
            jobs: setup.deploy_jobs(jobs),
        })
        .run_with_observer(&records, &steps, &observer)?;
    observer.finish();
    drop(credential);

    println!();
    for target in &report.targets {
        match &target.error {
            None => println!(
                "  {} {} ({} changed, {} tolerated)",
                "✓".green(),
                target.target,
                target.changed(),
                target.tolerated()
            ),
            Some(error) => ui::target_failure(error),
        }
    }

    if !report.is_success() {
        bail!(
            "{} of {} targets failed",
            report.failed_count(),
            report.targets.len()
        );
    }
    ui::success("Deploy completed");
    Ok(())
}
