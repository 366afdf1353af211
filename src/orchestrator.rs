//! Pipeline orchestration
//!
//! Selects the branch from the trigger context, applies the verification
//! gate, then runs the stages of that branch in order:
//!
//! - apply: provision → extract → inventory → deploy
//! - destroy: provision (in destroy mode) only
//!
//! A failing stage marks every later stage as skipped. Nothing is rolled
//! back; re-running the pipeline converges.

use crate::config::PipelineConfig;
use crate::extract::{self, ExtractedValues};
use crate::inventory::{self, ConnectionDefaults};
use crate::template::TemplateContext;
use anyhow::{Context, Result};
use provision::{Engine, Mode, OutputSet, ProgressCallback, Reconciliation, VarMap};
use remote::{
    Credential, ExecuteOptions, ExecutionObserver, Executor, InventoryRecord, Transport,
};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Trigger
// ============================================================================

/// Result of the upstream verification job
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Verification {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// What started the run
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    /// Branch or tag name
    pub ref_name: Option<String>,
    /// CI event name
    pub event: Option<String>,
    pub verification: Option<Verification>,
}

/// The pipeline's two paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Apply,
    Destroy,
}

impl Branch {
    /// Stages of this branch, in execution order
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Self::Apply => &[Stage::Provision, Stage::Extract, Stage::Inventory, Stage::Deploy],
            Self::Destroy => &[Stage::Provision],
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "APPLY"),
            Self::Destroy => write!(f, "DESTROY"),
        }
    }
}

impl Trigger {
    /// Destroy when the ref or the event names a destroy trigger
    pub fn branch(&self, destroy_triggers: &[String]) -> Branch {
        let matches = |value: &Option<String>| {
            value
                .as_deref()
                .is_some_and(|v| destroy_triggers.iter().any(|t| t == v))
        };
        if matches(&self.ref_name) || matches(&self.event) {
            Branch::Destroy
        } else {
            Branch::Apply
        }
    }

    /// Reason the branch may not proceed, if any
    ///
    /// Apply always requires a successful verification; destroy only when
    /// `gate_destroy` is set.
    pub fn gate(&self, branch: Branch, gate_destroy: bool) -> Option<String> {
        if branch == Branch::Destroy && !gate_destroy {
            return None;
        }
        match self.verification {
            Some(Verification::Success) => None,
            Some(other) => Some(format!("verification result is '{other}'")),
            None => Some("no verification result supplied".to_string()),
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Provision,
    Extract,
    Inventory,
    Deploy,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Extract => write!(f, "extract"),
            Self::Inventory => write!(f, "inventory"),
            Self::Deploy => write!(f, "deploy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
}

/// Outcome of a pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    pub branch: Branch,
    /// Why the gate stopped the run before any stage
    pub halted: Option<String>,
    pub stages: Vec<StageReport>,
    pub reconciliation: Option<Reconciliation>,
    pub deployment: Option<remote::RunReport>,
    /// Files written under the artifacts directory
    pub artifacts: Vec<PathBuf>,
}

impl PipelineReport {
    fn new(branch: Branch) -> Self {
        Self {
            branch,
            halted: None,
            stages: Vec::new(),
            reconciliation: None,
            deployment: None,
            artifacts: Vec::new(),
        }
    }

    /// True when no stage failed; a halted run is not a failure
    pub fn is_success(&self) -> bool {
        self.stages
            .iter()
            .all(|s| !matches!(s.status, StageStatus::Failed(_)))
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    pub fn failure(&self) -> Option<(Stage, &str)> {
        self.stages.iter().find_map(|s| match &s.status {
            StageStatus::Failed(reason) => Some((s.stage, reason.as_str())),
            _ => None,
        })
    }

    pub fn status(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| &s.status)
    }

    /// Record a stage result, returning the value on success
    fn finish<T>(&mut self, stage: Stage, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                log::info!("Stage {stage} succeeded");
                self.stages.push(StageReport {
                    stage,
                    status: StageStatus::Succeeded,
                });
                Some(value)
            }
            Err(e) => {
                let reason = format!("{e:#}");
                log::error!("Stage {stage} failed: {reason}");
                self.stages.push(StageReport {
                    stage,
                    status: StageStatus::Failed(reason),
                });
                None
            }
        }
    }

    /// Mark every stage of the branch that did not run as skipped
    fn skip_remaining(&mut self) {
        for stage in self.branch.stages() {
            if self.status(*stage).is_none() {
                self.stages.push(StageReport {
                    stage: *stage,
                    status: StageStatus::Skipped,
                });
            }
        }
    }
}

// ============================================================================
// Credential Source
// ============================================================================

/// Where the deploy stage gets its SSH key
#[derive(Clone, Default)]
pub enum KeySource {
    /// Let ssh use its own configuration
    #[default]
    Agent,
    /// Existing key file
    File(PathBuf),
    /// Key material, written to `path` or a temporary file
    Material { text: String, path: Option<PathBuf> },
}

impl KeySource {
    pub fn open(&self) -> remote::Result<Option<Credential>> {
        match self {
            Self::Agent => Ok(None),
            Self::File(path) => Credential::from_file(path).map(Some),
            Self::Material { text, path } => Credential::materialize(text, path.as_deref()).map(Some),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Everything a run needs, wired up by the caller
pub struct Pipeline<'a> {
    pub engine: &'a Engine<'a>,
    pub transport: &'a dyn Transport,
    pub config: &'a PipelineConfig,
    pub vars: &'a VarMap,
    pub key: KeySource,
    /// Targets configured in parallel
    pub deploy_jobs: usize,
}

impl Pipeline<'_> {
    /// Run the branch selected by `trigger`
    ///
    /// Stage failures are reported, not returned.
    pub fn run<P: ProgressCallback>(
        &self,
        trigger: &Trigger,
        progress: &mut P,
        observer: &dyn ExecutionObserver,
    ) -> PipelineReport {
        let branch = trigger.branch(&self.config.trigger.destroy);
        let mut report = PipelineReport::new(branch);
        log::info!(
            "Selected {branch} (ref: {}, event: {})",
            trigger.ref_name.as_deref().unwrap_or("-"),
            trigger.event.as_deref().unwrap_or("-")
        );

        if let Some(reason) = trigger.gate(branch, self.config.trigger.gate_destroy) {
            log::warn!("Run halted before {branch}: {reason}");
            report.halted = Some(reason);
            return report;
        }

        match branch {
            Branch::Apply => {
                self.apply(&mut report, progress, observer);
            }
            Branch::Destroy => {
                let result = self.provision(Mode::Destroy, progress);
                if let Some(reconciliation) = report.finish(Stage::Provision, result) {
                    report.reconciliation = Some(reconciliation);
                }
            }
        }

        report.skip_remaining();
        report
    }

    fn apply<P: ProgressCallback>(
        &self,
        report: &mut PipelineReport,
        progress: &mut P,
        observer: &dyn ExecutionObserver,
    ) -> Option<()> {
        let result = self.provision(Mode::Apply, progress);
        let reconciliation = report.finish(Stage::Provision, result)?;
        let outputs = reconciliation.outputs.clone();
        report.reconciliation = Some(reconciliation);

        let result = self.extract(&outputs, &mut report.artifacts);
        let values = report.finish(Stage::Extract, result)?;

        let result = self.inventory(&values, &mut report.artifacts);
        let (records, credential) = report.finish(Stage::Inventory, result)?;

        let result = self.deploy(&values, &records, observer);
        drop(credential);
        match result {
            Ok(deployment) => {
                let failed = deployment.failed_count();
                let result = if failed == 0 {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!(
                        "{failed} of {} targets failed",
                        deployment.targets.len()
                    ))
                };
                report.deployment = Some(deployment);
                report.finish(Stage::Deploy, result)
            }
            Err(e) => report.finish(Stage::Deploy, Err(e)),
        }
    }

    fn provision<P: ProgressCallback>(&self, mode: Mode, progress: &mut P) -> Result<Reconciliation> {
        let reconciliation = self
            .engine
            .reconcile_with_progress(&self.config.resources, mode, self.vars, progress)
            .inspect_err(|e| {
                if e.is_pre_execution() {
                    log::warn!("{mode} stopped before any resource was touched");
                }
            })?;
        Ok(reconciliation)
    }

    /// Write the outputs artifact, then pull the required values
    fn extract(&self, outputs: &OutputSet, artifacts: &mut Vec<PathBuf>) -> Result<ExtractedValues> {
        let path = self.config.outputs_path();
        extract::write_outputs(&path, outputs)?;
        artifacts.push(path);
        Ok(extract::extract(outputs, &self.config.outputs)?)
    }

    /// Build and write the inventory; the credential lives until deploy ends
    fn inventory(
        &self,
        values: &ExtractedValues,
        artifacts: &mut Vec<PathBuf>,
    ) -> Result<(Vec<InventoryRecord>, Option<Credential>)> {
        let credential = self.key.open().context("Failed to prepare SSH credential")?;
        let defaults = ConnectionDefaults {
            key_file: credential
                .as_ref()
                .map(|c| c.path().to_path_buf())
                .or_else(|| self.config.connection.key_file.clone()),
            ..self.config.connection.clone()
        };

        let records = inventory::build(values, &defaults)?;
        let path = self.config.inventory_path();
        inventory::write(&path, &records)?;
        artifacts.push(path);
        log::info!("Inventory: {} targets", records.len());
        Ok((records, credential))
    }

    fn deploy(
        &self,
        values: &ExtractedValues,
        records: &[InventoryRecord],
        observer: &dyn ExecutionObserver,
    ) -> Result<remote::RunReport> {
        let context = TemplateContext {
            outputs: values,
            vars: self.vars,
        };
        let steps = context.render_steps(&self.config.deploy.steps)?;

        let report = Executor::new(self.transport)
            .with_options(ExecuteOptions {
                jobs: self.deploy_jobs,
            })
            .run_with_observer(records, &steps, observer)?;
        Ok(report)
    }
}
