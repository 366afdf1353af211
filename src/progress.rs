//! Progress display for reconcile stages and deploy targets

use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use provision::{Action, Address, ProgressCallback, ProviderError};
use remote::{ExecutionObserver, InventoryRecord, StepOutcome, StepReport, TargetReport, TaskStep};

use crate::ui;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn new_bar(len: u64, quiet: bool) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if quiet {
        bar.set_draw_target(ProgressDrawTarget::hidden());
    }
    bar.set_style(bar_style());
    bar
}

/// Print above the bar, or plainly when the bar is not drawn (CI logs)
fn emit(bar: Option<&ProgressBar>, quiet: bool, line: String) {
    match bar {
        Some(bar) if !bar.is_hidden() => bar.println(line),
        _ if !quiet => println!("{line}"),
        _ => {}
    }
}

/// One bar per reconcile stage
pub struct ReconcileProgress {
    quiet: bool,
    bar: Option<ProgressBar>,
}

impl ReconcileProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            bar: None,
        }
    }

    fn println(&self, line: String) {
        emit(self.bar.as_ref(), self.quiet, line);
    }
}

impl ProgressCallback for ReconcileProgress {
    fn on_stage_start(&mut self, stage: usize, count: usize) {
        let bar = new_bar(count as u64, self.quiet);
        bar.set_message(format!("stage {}", stage + 1));
        self.bar = Some(bar);
    }

    fn on_resource_start(&mut self, address: &Address, action: Action) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{action} {address}"));
        }
    }

    fn on_resource_complete(&mut self, address: &Address, action: Action, error: Option<&ProviderError>) {
        let line = match error {
            None => format!(
                "  {} {address} {}",
                ui::action_symbol(action),
                action.past_tense().dimmed()
            ),
            Some(e) => format!("  {} {address}: {}", "✗".red(), ui::truncate(&e.to_string(), 100)),
        };
        self.println(line);
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_stage_complete(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// One bar for all (target, step) pairs; workers report concurrently
///
/// The bar grows by one step sequence each time a target starts.
pub struct DeployProgress {
    bar: ProgressBar,
    steps: usize,
    quiet: bool,
}

impl DeployProgress {
    pub fn new(steps: usize, quiet: bool) -> Self {
        let bar = new_bar(0, quiet);
        bar.set_message("deploying");
        Self { bar, steps, quiet }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ExecutionObserver for DeployProgress {
    fn on_step_start(&self, target: &InventoryRecord, index: usize, step: &TaskStep) {
        if index == 0 {
            self.bar.inc_length(self.steps as u64);
        }
        self.bar
            .set_message(format!("{}: [{}] {}", target.host, index + 1, step.label()));
    }

    fn on_step_complete(&self, target: &InventoryRecord, report: &StepReport) {
        let marker = match report.outcome() {
            StepOutcome::Changed => "changed".yellow(),
            StepOutcome::Unchanged => "ok".green(),
            StepOutcome::Tolerated(_) => "tolerated".magenta(),
        };
        emit(Some(&self.bar), self.quiet, format!(
            "  {} {} {}",
            marker,
            target.host.dimmed(),
            ui::truncate(&report.name, 70)
        ));
        self.bar.inc(1);
    }

    fn on_target_complete(&self, report: &TargetReport) {
        if let Some(error) = &report.error {
            emit(Some(&self.bar), self.quiet, format!(
                "  {} {}",
                "✗".red(),
                ui::truncate(&error.to_string(), 120)
            ));
            // Steps after the failing one never run
            let remaining = self.steps.saturating_sub(report.steps.len());
            let len = self.bar.length().unwrap_or(0);
            self.bar.set_length(len.saturating_sub(remaining as u64));
        } else {
            log::debug!(
                "{}: {} changed, {} tolerated",
                report.target.host,
                report.changed(),
                report.tolerated()
            );
        }
    }
}
