//! Planning - schedules stages and diffs declared against live attributes
//!
//! The same diff is used for a read-only [`Plan`] and by the engine at
//! execution time; only the source of referenced values differs.

use crate::error::GraphError;
use crate::graph::{Dependencies, ResourceGraph, stages_for};
use crate::reference::{Lookup, Resolution, resolve};
use crate::state::{DeploymentState, LiveResource};
use crate::types::{Address, Attributes, Mode, ReconcileSummary, ResourceSpec, VarMap};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Operation decided for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl Action {
    /// Whether the action calls the provider
    #[must_use]
    pub fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Plan marker: `+`, `~`, `-` or blank
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }

    /// Past tense, for reports
    #[must_use]
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Update => "updated",
            Self::Delete => "deleted",
            Self::NoOp => "unchanged",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

/// One attribute difference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    pub key: String,
    /// Live value, `None` when the attribute (or resource) does not exist yet
    pub before: Option<Value>,
    /// Declared value, `None` when it is only known after apply
    pub after: Option<Value>,
}

impl AttributeChange {
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.after.is_some()
    }
}

/// Planned operation for one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub address: Address,
    pub action: Action,
    pub changes: Vec<AttributeChange>,
    /// Index of the stage the operation runs in
    pub stage: usize,
}

/// Read-only preview of a reconcile run
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub mode: Mode,
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    #[must_use]
    pub fn summary(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for change in &self.changes {
            summary.add(&change.action);
        }
        summary
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action.is_change())
    }

    /// Only the entries that call the provider
    pub fn pending(&self) -> impl Iterator<Item = &PlannedChange> {
        self.changes.iter().filter(|c| c.action.is_change())
    }
}

/// A scheduled unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Create, update or keep a declared resource
    Converge(Address),
    /// Delete a resource recorded in state
    Remove(Address),
}

impl Step {
    #[must_use]
    pub fn address(&self) -> &Address {
        match self {
            Self::Converge(address) | Self::Remove(address) => address,
        }
    }
}

/// Order the work of a run into stages.
///
/// Apply: orphans (in state, no longer declared) are removed first,
/// dependents before dependencies, then declared resources converge in
/// topological stages. Destroy: every resource in state is removed in reverse
/// topological order; declared resources use declared edges, orphans the
/// edges recorded in state.
pub fn schedule(
    graph: &ResourceGraph<'_>,
    state: &DeploymentState,
    mode: Mode,
) -> Result<Vec<Vec<Step>>, GraphError> {
    let mut stages = Vec::new();

    match mode {
        Mode::Apply => {
            let orphans: Dependencies = state
                .resources
                .iter()
                .filter(|(address, _)| !graph.contains(address))
                .map(|(address, live)| (address.clone(), recorded_dependencies(live)))
                .collect();
            stages.extend(removal_stages(&orphans)?);
            stages.extend(graph.stages().iter().map(|stage| {
                stage.iter().cloned().map(Step::Converge).collect::<Vec<_>>()
            }));
        }
        Mode::Destroy => {
            let existing: Dependencies = state
                .resources
                .iter()
                .map(|(address, live)| {
                    let deps = if graph.contains(address) {
                        graph.dependencies_of(address).into_iter().collect()
                    } else {
                        recorded_dependencies(live)
                    };
                    (address.clone(), deps)
                })
                .collect();
            stages.extend(removal_stages(&existing)?);
        }
    }

    Ok(stages)
}

fn recorded_dependencies(live: &LiveResource) -> BTreeSet<Address> {
    live.depends_on.iter().cloned().collect()
}

fn removal_stages(dependencies: &Dependencies) -> Result<Vec<Vec<Step>>, GraphError> {
    Ok(stages_for(dependencies)?
        .into_iter()
        .rev()
        .map(|stage| stage.into_iter().rev().map(Step::Remove).collect())
        .collect())
}

/// Compare declared attributes against live ones.
///
/// Only declared keys are compared; provider-computed attributes never cause
/// an update. A reference without a value yet makes the attribute "known after
/// apply", which always counts as a change.
pub fn diff(
    spec: &ResourceSpec,
    live: Option<&LiveResource>,
    lookup: &dyn Lookup,
) -> (Action, Vec<AttributeChange>) {
    let mut changes = Vec::new();

    for (key, declared) in &spec.attributes {
        let after = match resolve(declared, lookup) {
            Resolution::Known(value) => Some(value),
            Resolution::Pending(_) => None,
        };
        let before = live.and_then(|l| l.attributes.get(key)).cloned();

        if live.is_none() || after.is_none() || after != before {
            changes.push(AttributeChange {
                key: key.clone(),
                before,
                after,
            });
        }
    }

    let action = match live {
        None => Action::Create,
        Some(_) if changes.is_empty() => Action::NoOp,
        Some(_) => Action::Update,
    };
    (action, changes)
}

/// Values visible to references during execution: variables plus live state
pub(crate) struct LiveView<'a> {
    pub vars: &'a VarMap,
    pub state: &'a DeploymentState,
}

impl Lookup for LiveView<'_> {
    fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn attribute(&self, address: &Address, attribute: &str) -> Option<&Value> {
        self.state
            .get(address)
            .and_then(|live| live.attributes.get(attribute))
    }
}

/// Values visible to references while planning: what the state will look
/// like once earlier planned operations are done, as far as it is known
struct Projection<'a> {
    vars: &'a VarMap,
    attributes: BTreeMap<Address, Attributes>,
}

impl Lookup for Projection<'_> {
    fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn attribute(&self, address: &Address, attribute: &str) -> Option<&Value> {
        self.attributes.get(address).and_then(|attrs| attrs.get(attribute))
    }
}

/// Build a read-only plan
pub fn plan(
    graph: &ResourceGraph<'_>,
    state: &DeploymentState,
    mode: Mode,
    vars: &VarMap,
) -> Result<Plan, GraphError> {
    let mut projection = Projection {
        vars,
        attributes: state
            .resources
            .iter()
            .map(|(address, live)| (address.clone(), live.attributes.clone()))
            .collect(),
    };
    let mut changes = Vec::new();

    for (stage, steps) in schedule(graph, state, mode)?.into_iter().enumerate() {
        for step in steps {
            match step {
                Step::Remove(address) => {
                    projection.attributes.remove(&address);
                    changes.push(PlannedChange {
                        address,
                        action: Action::Delete,
                        changes: Vec::new(),
                        stage,
                    });
                }
                Step::Converge(address) => {
                    let Some(spec) = graph.spec(&address) else {
                        continue;
                    };
                    let (action, attribute_changes) = diff(spec, state.get(&address), &projection);

                    if action.is_change() {
                        let projected = projection.attributes.entry(address.clone()).or_default();
                        if action == Action::Create {
                            projected.clear();
                        }
                        for change in &attribute_changes {
                            match &change.after {
                                Some(value) => {
                                    projected.insert(change.key.clone(), value.clone());
                                }
                                None => {
                                    projected.remove(&change.key);
                                }
                            }
                        }
                    }

                    changes.push(PlannedChange {
                        address,
                        action,
                        changes: attribute_changes,
                        stage,
                    });
                }
            }
        }
    }

    Ok(Plan { mode, changes })
}
