//! Execution engine - runs the step sequence on every target
//!
//! Targets run in parallel on a bounded rayon pool; steps within a target are
//! strictly ordered. A failure aborts only the target it happened on.

use crate::error::{Error, Result, TargetStepError, ToleratedError};
use crate::step::{CHANGED_MARKER, PhaseKind, TaskStep};
use crate::transport::Transport;
use crate::types::{ExecuteOptions, InventoryRecord, RunReport, StepReport, TargetReport};
use rayon::prelude::*;

/// Progress callbacks; invoked from worker threads
pub trait ExecutionObserver: Sync {
    /// Called before a step starts on a target
    fn on_step_start(&self, _target: &InventoryRecord, _index: usize, _step: &TaskStep) {}

    /// Called after a step completed on a target
    fn on_step_complete(&self, _target: &InventoryRecord, _report: &StepReport) {}

    /// Called when a target finished, successfully or not
    fn on_target_complete(&self, _report: &TargetReport) {}
}

/// Observer that ignores everything
pub struct NoObserver;

impl ExecutionObserver for NoObserver {}

/// Runs task steps against an inventory
pub struct Executor<'a> {
    transport: &'a dyn Transport,
    options: ExecuteOptions,
}

impl<'a> Executor<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self {
            transport,
            options: ExecuteOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `steps` on every target
    pub fn run(&self, inventory: &[InventoryRecord], steps: &[TaskStep]) -> Result<RunReport> {
        self.run_with_observer(inventory, steps, &NoObserver)
    }

    /// Run `steps` on every target, reporting progress
    ///
    /// Only a worker pool failure is an `Err`; target failures are reported
    /// in the [`RunReport`].
    pub fn run_with_observer(
        &self,
        inventory: &[InventoryRecord],
        steps: &[TaskStep],
        observer: &dyn ExecutionObserver,
    ) -> Result<RunReport> {
        if inventory.is_empty() {
            log::info!("Inventory is empty, nothing to deploy");
            return Ok(RunReport::default());
        }

        let jobs = self.options.jobs.max(1).min(inventory.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;

        let targets = pool.install(|| {
            inventory
                .par_iter()
                .map(|target| {
                    let report = self.run_target(target, steps, observer);
                    observer.on_target_complete(&report);
                    report
                })
                .collect()
        });

        Ok(RunReport { targets })
    }

    fn run_target(
        &self,
        target: &InventoryRecord,
        steps: &[TaskStep],
        observer: &dyn ExecutionObserver,
    ) -> TargetReport {
        let mut reports = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            observer.on_step_start(target, index, step);
            match self.run_step(target, step) {
                Ok(report) => {
                    observer.on_step_complete(target, &report);
                    reports.push(report);
                }
                Err(source) => {
                    let error = TargetStepError {
                        host: target.host.clone(),
                        index: index + 1,
                        step: step.label(),
                        source,
                    };
                    log::error!("{error}");
                    return TargetReport {
                        target: target.clone(),
                        steps: reports,
                        error: Some(error),
                    };
                }
            }
        }

        log::info!("{}: {} steps completed", target.host, reports.len());
        TargetReport {
            target: target.clone(),
            steps: reports,
            error: None,
        }
    }

    fn run_step(&self, target: &InventoryRecord, step: &TaskStep) -> Result<StepReport> {
        let name = step.label();
        let mut changed = false;
        let mut tolerated = Vec::new();

        for phase in step.phases() {
            let output = self
                .transport
                .run(target, &phase.script, phase.stdin.as_deref(), step.sudo())?;

            if output.success() {
                changed |= output.stdout.lines().any(|line| line.trim() == CHANGED_MARKER);
                continue;
            }

            match phase.kind {
                PhaseKind::Tolerated => {
                    let message = if output.stderr.is_empty() {
                        format!("exit status {}", output.status.unwrap_or(-1))
                    } else {
                        output.stderr.clone()
                    };
                    log::warn!("{}: {name}: tolerated failure: {message}", target.host);
                    tolerated.push(ToleratedError {
                        step: name.clone(),
                        message,
                    });
                }
                PhaseKind::Verify => return Err(Error::Verification(output.stderr)),
                PhaseKind::Required => {
                    return Err(Error::CommandFailed {
                        status: output.status,
                        stderr: output.stderr,
                    });
                }
            }
        }

        log::debug!("{}: {name}: {}", target.host, if changed { "changed" } else { "ok" });
        Ok(StepReport {
            name,
            changed,
            tolerated,
        })
    }
}
