//! `deckhand check` - validate the configuration offline

use anyhow::{Result, bail};
use provision::{OutputKind, OutputValue, ResourceGraph, VarMap};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Context;
use crate::config::PipelineConfig;
use crate::extract::ExtractedValues;
use crate::template::TemplateContext;
use crate::ui;
use crate::vars::{self, VarKind};

/// One problem found in the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Error(String),
    Warning(String),
}

pub fn run(ctx: &Context) -> Result<()> {
    let config = PipelineConfig::load(&ctx.config)?;
    ui::header(&format!("Checking {}", ctx.config.display()));

    let findings = validate(&config, |key| std::env::var(key).ok());
    let mut errors = 0;
    for finding in &findings {
        match finding {
            Finding::Error(msg) => {
                errors += 1;
                ui::error(msg);
            }
            Finding::Warning(msg) => ui::warn(msg),
        }
    }

    if errors > 0 {
        bail!("{errors} problems found");
    }
    ui::success(&format!(
        "{} resources, {} deploy steps, configuration is valid",
        config.resources.len(),
        config.deploy.steps.len()
    ));
    Ok(())
}

/// Validate everything that can be checked without a provider or hosts
pub fn validate(config: &PipelineConfig, env: impl Fn(&str) -> Option<String>) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Err(e) = config.state.state_id() {
        findings.push(Finding::Error(format!("{e:#}")));
    }
    if config.provider.program.is_none() && !config.resources.is_empty() {
        findings.push(Finding::Error("[provider] program is not set".into()));
    }

    let vars = variables(config, &env, &mut findings);

    match ResourceGraph::build(&config.resources, &vars) {
        Ok(graph) => log::info!("{} resources in {} stages", graph.len(), graph.stages().len()),
        Err(e) => findings.push(Finding::Error(e.to_string())),
    }

    let bound = bound_outputs(config);
    let mut required = config.outputs.required.clone();
    required.insert(config.outputs.targets.clone(), OutputKind::List);
    for (name, kind) in &required {
        match bound.get(name) {
            None => findings.push(Finding::Error(format!(
                "required output '{name}' is not bound by any resource"
            ))),
            Some(found) if found != kind => findings.push(Finding::Error(format!(
                "output '{name}' is bound as a {found}, required as a {kind}"
            ))),
            Some(_) => {}
        }
    }

    // Templates only see required outputs
    let outputs = ExtractedValues {
        targets: Vec::new(),
        values: required
            .iter()
            .map(|(name, kind)| {
                let value = match kind {
                    OutputKind::Scalar => OutputValue::Scalar(String::new()),
                    OutputKind::List => OutputValue::List(Vec::new()),
                };
                (name.clone(), value)
            })
            .collect(),
    };
    let context = TemplateContext {
        outputs: &outputs,
        vars: &vars,
    };
    if let Err(e) = context.render_steps(&config.deploy.steps) {
        findings.push(Finding::Error(e.to_string()));
    }

    findings
}

/// Resolve variables, substituting placeholders for unset ones
fn variables(
    config: &PipelineConfig,
    env: &impl Fn(&str) -> Option<String>,
    findings: &mut Vec<Finding>,
) -> VarMap {
    let mut vars = VarMap::new();
    for (name, decl) in &config.variables {
        let single = BTreeMap::from([(name.clone(), decl.clone())]);
        match vars::resolve(&single, env) {
            Ok(resolved) => vars.extend(resolved),
            Err(e @ vars::VarError::Missing { .. }) => {
                findings.push(Finding::Warning(e.to_string()));
                let placeholder = match decl.kind {
                    VarKind::String => Value::String(String::new()),
                    VarKind::List => Value::Array(Vec::new()),
                };
                vars.insert(name.clone(), placeholder);
            }
            Err(e) => findings.push(Finding::Error(e.to_string())),
        }
    }
    vars
}

/// Output names bound by resources, with the kind they produce
fn bound_outputs(config: &PipelineConfig) -> BTreeMap<String, OutputKind> {
    config
        .resources
        .iter()
        .flat_map(|spec| &spec.outputs)
        .map(|binding| {
            let kind = if binding.list {
                OutputKind::List
            } else {
                OutputKind::Scalar
            };
            (binding.name.clone(), kind)
        })
        .collect()
}
