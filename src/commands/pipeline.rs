//! `deckhand run` - the CI entry point

use anyhow::{Result, bail};
use colored::Colorize;
use provision::Engine;

use crate::Context;
use crate::cli::RunArgs;
use crate::commands::Setup;
use crate::orchestrator::{Pipeline, PipelineReport, StageStatus, Trigger};
use crate::progress::{DeployProgress, ReconcileProgress};
use crate::ui;

pub fn run(ctx: &Context, args: RunArgs) -> Result<()> {
    let setup = Setup::load(ctx)?;
    let vars = setup.vars()?;
    let provider = setup.provider()?;
    let transport = setup.transport();

    let engine = Engine::new(&provider, setup.backend.as_ref(), setup.state_id.clone())
        .with_options(setup.reconcile_options(args.jobs));
    let pipeline = Pipeline {
        engine: &engine,
        transport: &transport,
        config: &setup.config,
        vars: &vars,
        key: setup.key_source(),
        deploy_jobs: setup.deploy_jobs(args.deploy_jobs),
    };

    let trigger = Trigger {
        ref_name: args.ref_name,
        event: args.event,
        verification: args.verification,
    };

    let mut progress = ReconcileProgress::new(ctx.quiet);
    let observer = DeployProgress::new(setup.config.deploy.steps.len(), ctx.quiet);
    let report = pipeline.run(&trigger, &mut progress, &observer);
    observer.finish();

    print_report(&report, ctx.verbose > 0);

    if let Some((stage, reason)) = report.failure() {
        bail!("Pipeline failed at {stage}: {reason}");
    }
    Ok(())
}

fn print_report(report: &PipelineReport, detailed: bool) {
    ui::header(&format!("deckhand {}", report.branch));

    if let Some(reason) = &report.halted {
        ui::warn(&format!("Halted before any stage: {reason}"));
        ui::dim("Nothing was provisioned or deployed");
        return;
    }

    for stage in &report.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "succeeded".green(),
            StageStatus::Failed(_) => "failed".red().bold(),
            StageStatus::Skipped => "skipped".dimmed(),
        };
        println!("  {:<10} {status}", stage.stage.to_string());
        if let StageStatus::Failed(reason) = &stage.status {
            ui::dim(reason);
        }
    }

    if let Some(reconciliation) = &report.reconciliation {
        let s = &reconciliation.summary;
        ui::section("Resources");
        ui::kv(
            "Changes",
            &format!(
                "{} created, {} updated, {} deleted, {} unchanged",
                s.created, s.updated, s.deleted, s.unchanged
            ),
        );
        ui::kv("State serial", &reconciliation.serial.to_string());
        if detailed {
            for change in reconciliation.changes.iter().filter(|c| c.action.is_change()) {
                println!("    {} {}", ui::action_symbol(change.action), change.address);
            }
        }
    }

    if let Some(deployment) = &report.deployment {
        ui::section("Targets");
        if deployment.targets.is_empty() {
            ui::dim("No targets");
        }
        for target in &deployment.targets {
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
    }

    if !report.artifacts.is_empty() {
        ui::section("Artifacts");
        for path in &report.artifacts {
            ui::dim(&path.display().to_string());
        }
    }

    println!();
    if report.is_success() {
        ui::success(&format!("{} completed", report.branch));
    }
}
