//! Reconciliation engine - executes stages under the state lock
//!
//! Operations inside a stage are independent and run on a bounded rayon pool.
//! Results are recorded, and state persisted, on the calling thread only.

use crate::context::{NoProgress, ProgressCallback};
use crate::error::{Error, ProviderError, Result};
use crate::graph::ResourceGraph;
use crate::planner::{self, Action, LiveView, Plan, PlannedChange, Step};
use crate::provider::{Provider, ResourceRequest};
use crate::reference::resolve_all;
use crate::state::{self, DeploymentState, LiveResource, StateBackend, StateId, StateLock};
use crate::types::{
    Address, Attributes, Mode, OutputSet, OutputValue, ReconcileOptions, ReconcileSummary,
    ResourceSpec, VarMap, json_text,
};
use rayon::prelude::*;
use serde_json::Value;

/// Outcome of a successful reconcile run
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub mode: Mode,
    /// Fresh outputs; empty after destroy
    pub outputs: OutputSet,
    /// Every resource touched or checked, in execution order
    pub changes: Vec<PlannedChange>,
    pub summary: ReconcileSummary,
    /// State serial after the run
    pub serial: u64,
}

/// One provider call prepared on the controlling thread
struct Operation {
    address: Address,
    action: Action,
    changes: Vec<planner::AttributeChange>,
    request: std::result::Result<Attributes, String>,
    live: Attributes,
}

/// Reconciles resource specs against one state object
pub struct Engine<'a> {
    provider: &'a dyn Provider,
    backend: &'a dyn StateBackend,
    state_id: StateId,
    options: ReconcileOptions,
}

impl<'a> Engine<'a> {
    pub fn new(provider: &'a dyn Provider, backend: &'a dyn StateBackend, state_id: StateId) -> Self {
        Self {
            provider,
            backend,
            state_id,
            options: ReconcileOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn state_id(&self) -> &StateId {
        &self.state_id
    }

    /// Preview a run without locking or mutating anything
    pub fn plan(&self, specs: &[ResourceSpec], mode: Mode, vars: &VarMap) -> Result<Plan> {
        let graph = ResourceGraph::build(specs, vars)?;
        let state = self.current_state()?;
        Ok(planner::plan(&graph, &state, mode, vars)?)
    }

    pub fn reconcile(&self, specs: &[ResourceSpec], mode: Mode, vars: &VarMap) -> Result<Reconciliation> {
        self.reconcile_with_progress(specs, mode, vars, &mut NoProgress)
    }

    /// Reconcile under the state lock, reporting progress
    ///
    /// Fails fast on the first failing stage: later stages are not attempted,
    /// and every success recorded so far is persisted.
    pub fn reconcile_with_progress<P: ProgressCallback>(
        &self,
        specs: &[ResourceSpec],
        mode: Mode,
        vars: &VarMap,
        progress: &mut P,
    ) -> Result<Reconciliation> {
        let graph = ResourceGraph::build(specs, vars)?;
        let lock = StateLock::acquire(self.backend, &self.state_id, &mode.to_string())?;
        let mut state = lock.read()?;
        let stages = planner::schedule(&graph, &state, mode)?;
        log::info!(
            "Reconciling {} ({mode}): {} resources declared, {} in state",
            self.state_id,
            graph.len(),
            state.resources.len()
        );

        let pool = if self.options.jobs > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.options.jobs)
                    .build()
                    .map_err(|e| Error::Pool(e.to_string()))?,
            )
        } else {
            None
        };

        let mut changes = Vec::new();
        let mut summary = ReconcileSummary::default();

        for (index, steps) in stages.into_iter().enumerate() {
            let mut operations = Vec::new();

            for step in steps {
                match self.prepare(&graph, &state, vars, step) {
                    Some(op) if op.action.is_change() => operations.push(op),
                    Some(op) => {
                        summary.add(&op.action);
                        changes.push(PlannedChange {
                            address: op.address,
                            action: op.action,
                            changes: op.changes,
                            stage: index,
                        });
                    }
                    None => {}
                }
            }

            if operations.is_empty() {
                continue;
            }

            progress.on_stage_start(index, operations.len());
            let results = self.execute_stage(operations, pool.as_ref(), progress);

            let mut failure = None;
            let mut changed = false;
            for (op, result) in results {
                match result {
                    Ok(computed) => {
                        record(&mut state, &graph, &op, computed);
                        changed = true;
                        summary.add(&op.action);
                        changes.push(PlannedChange {
                            address: op.address,
                            action: op.action,
                            changes: op.changes,
                            stage: index,
                        });
                    }
                    Err(cause) => {
                        log::warn!("{} of {} failed: {cause}", op.action, op.address);
                        if failure.is_none() {
                            failure = Some((op.address, cause));
                        }
                    }
                }
            }
            progress.on_stage_complete();

            if changed {
                state.commit()?;
                lock.write(&state)?;
            }

            if let Some((address, cause)) = failure {
                return Err(Error::Provision {
                    resource: address.to_string(),
                    cause,
                });
            }
        }

        let outputs = match mode {
            Mode::Apply => compute_outputs(&graph, &state),
            Mode::Destroy => OutputSet::new(),
        };
        if state.outputs != outputs {
            state.outputs = outputs.clone();
            state.commit()?;
            lock.write(&state)?;
        }

        let serial = state.serial;
        lock.release()?;
        log::info!(
            "Reconciled {}: {} created, {} updated, {} deleted, {} unchanged",
            self.state_id,
            summary.created,
            summary.updated,
            summary.deleted,
            summary.unchanged
        );

        Ok(Reconciliation {
            mode,
            outputs,
            changes,
            summary,
            serial,
        })
    }

    fn current_state(&self) -> Result<DeploymentState> {
        Ok(state::load(self.backend, &self.state_id)?
            .unwrap_or_else(|| DeploymentState::new(&self.state_id)))
    }

    /// Decide what a step does given the state as it is now
    fn prepare(
        &self,
        graph: &ResourceGraph<'_>,
        state: &DeploymentState,
        vars: &VarMap,
        step: Step,
    ) -> Option<Operation> {
        match step {
            Step::Remove(address) => {
                let live = state.get(&address)?.attributes.clone();
                Some(Operation {
                    address,
                    action: Action::Delete,
                    changes: Vec::new(),
                    request: Ok(Attributes::new()),
                    live,
                })
            }
            Step::Converge(address) => {
                let spec = graph.spec(&address)?;
                let current = state.get(&address);
                let view = LiveView { vars, state };
                let (action, changes) = planner::diff(spec, current, &view);
                Some(Operation {
                    action,
                    changes,
                    request: resolve_all(&spec.attributes, &view),
                    live: current.map(|l| l.attributes.clone()).unwrap_or_default(),
                    address,
                })
            }
        }
    }

    fn execute_stage<P: ProgressCallback>(
        &self,
        operations: Vec<Operation>,
        pool: Option<&rayon::ThreadPool>,
        progress: &mut P,
    ) -> Vec<(Operation, std::result::Result<Attributes, ProviderError>)> {
        match pool {
            Some(pool) if operations.len() > 1 => {
                for op in &operations {
                    progress.on_resource_start(&op.address, op.action);
                }
                let results: Vec<_> = pool.install(|| {
                    operations
                        .into_par_iter()
                        .map(|op| {
                            let result = self.run(&op);
                            (op, result)
                        })
                        .collect()
                });
                for (op, result) in &results {
                    progress.on_resource_complete(&op.address, op.action, result.as_ref().err());
                }
                results
            }
            _ => {
                // Sequential: stop at the first failure
                let mut results = Vec::with_capacity(operations.len());
                for op in operations {
                    progress.on_resource_start(&op.address, op.action);
                    let result = self.run(&op);
                    progress.on_resource_complete(&op.address, op.action, result.as_ref().err());
                    let failed = result.is_err();
                    results.push((op, result));
                    if failed {
                        break;
                    }
                }
                results
            }
        }
    }

    fn run(&self, op: &Operation) -> std::result::Result<Attributes, ProviderError> {
        log::debug!("{} {}", op.action, op.address);
        let attributes = op.request.clone().map_err(ProviderError::Unresolved)?;
        let request = ResourceRequest {
            address: op.address.clone(),
            attributes,
        };

        match op.action {
            Action::Create => self.provider.create(&request),
            Action::Update => self.provider.update(&request, &op.live),
            Action::Delete => self
                .provider
                .delete(&op.address, &op.live)
                .map(|()| Attributes::new()),
            Action::NoOp => Ok(op.live.clone()),
        }
    }
}

/// Apply a successful operation to state
fn record(state: &mut DeploymentState, graph: &ResourceGraph<'_>, op: &Operation, computed: Attributes) {
    if op.action == Action::Delete {
        state.resources.remove(&op.address);
        return;
    }

    // Declared values win over computed ones so the next diff is clean
    let mut attributes = computed;
    if let Ok(declared) = &op.request {
        attributes.extend(declared.clone());
    }
    state.resources.insert(
        op.address.clone(),
        LiveResource {
            attributes,
            depends_on: graph.dependencies_of(&op.address),
        },
    );
}

/// Collect output bindings from live attributes, in topological order
fn compute_outputs(graph: &ResourceGraph<'_>, state: &DeploymentState) -> OutputSet {
    let mut outputs = OutputSet::new();

    for (address, binding) in graph.output_bindings() {
        let value = state
            .get(address)
            .and_then(|live| live.attributes.get(&binding.attribute));

        if binding.list {
            let entry = outputs
                .entry(binding.name.clone())
                .or_insert_with(|| OutputValue::List(Vec::new()));
            match (entry, value) {
                (OutputValue::List(items), Some(Value::Array(values))) => {
                    items.extend(values.iter().map(json_text));
                }
                (OutputValue::List(items), Some(value)) => items.push(json_text(value)),
                (_, None) => log::warn!(
                    "{address} has no attribute '{}' for output '{}'",
                    binding.attribute,
                    binding.name
                ),
                (OutputValue::Scalar(_), Some(_)) => {}
            }
        } else if let Some(value) = value {
            outputs.insert(binding.name.clone(), OutputValue::Scalar(json_text(value)));
        } else {
            log::warn!(
                "{address} has no attribute '{}'; output '{}' omitted",
                binding.attribute,
                binding.name
            );
        }
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::testing::{MemoryBackend, RecordingProvider};
    use crate::types::OutputBinding;
    use serde_json::json;

    fn id() -> StateId {
        StateId::new("webapp/test").unwrap()
    }

    fn vars() -> VarMap {
        let mut vars = VarMap::new();
        vars.insert("ami_id".into(), json!("ami-123"));
        vars
    }

    fn fleet() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("aws_security_group", "web").with_attribute("ingress", json!([22, 80])),
            ResourceSpec::new("aws_instance", "web_1")
                .with_attribute("ami", "${var.ami_id}")
                .with_attribute("security_group", "${aws_security_group.web.id}")
                .with_output(OutputBinding::list("ec2_public_ips", "public_ip")),
            ResourceSpec::new("aws_instance", "web_2")
                .with_attribute("ami", "${var.ami_id}")
                .with_attribute("security_group", "${aws_security_group.web.id}")
                .with_output(OutputBinding::list("ec2_public_ips", "public_ip")),
            ResourceSpec::new("aws_db_instance", "app")
                .with_attribute("engine", "mysql")
                .with_output(OutputBinding::scalar("rds_endpoint", "endpoint")),
        ]
    }

    fn provider() -> RecordingProvider {
        RecordingProvider::new()
            .computing("aws_instance.web_1", "public_ip", json!("1.2.3.4"))
            .computing("aws_instance.web_2", "public_ip", json!("5.6.7.8"))
            .computing("aws_db_instance.app", "endpoint", json!("app.db.local:3306"))
    }

    fn sequential() -> ReconcileOptions {
        ReconcileOptions { jobs: 1 }
    }

    #[test]
    fn test_apply_creates_in_dependency_order_and_outputs() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id()).with_options(sequential());

        let result = engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap();

        assert_eq!(result.summary.created, 4);
        let calls = provider.calls();
        let sg = calls.iter().position(|c| c == "create aws_security_group.web").unwrap();
        let web_1 = calls.iter().position(|c| c == "create aws_instance.web_1").unwrap();
        assert!(sg < web_1);

        assert_eq!(
            result.outputs.get("ec2_public_ips"),
            Some(&OutputValue::List(vec!["1.2.3.4".into(), "5.6.7.8".into()]))
        );
        assert_eq!(
            result.outputs.get("rds_endpoint"),
            Some(&OutputValue::Scalar("app.db.local:3306".into()))
        );

        let stored = backend.stored(&id()).unwrap();
        let web = stored.get(&Address::new("aws_instance", "web_1")).unwrap();
        assert_eq!(web.attributes["security_group"], json!("aws_security_group-web"));
        assert_eq!(web.depends_on, vec![Address::new("aws_security_group", "web")]);
        assert_eq!(stored.outputs, result.outputs);
    }

    #[test]
    fn test_second_apply_is_a_no_op() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());

        let first = engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap();
        provider.clear();
        let writes = backend.writes();

        let second = engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap();
        assert!(provider.calls().is_empty());
        assert_eq!(second.summary.unchanged, 4);
        assert!(!second.summary.has_changes());
        assert_eq!(second.serial, first.serial);
        assert_eq!(backend.writes(), writes);
        assert_eq!(second.outputs, first.outputs);
    }

    #[test]
    fn test_changed_attribute_updates_only_that_resource() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());
        engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap();
        provider.clear();

        let mut specs = fleet();
        specs[3] = specs[3].clone().with_attribute("engine", "postgres");
        let result = engine.reconcile(&specs, Mode::Apply, &vars()).unwrap();

        assert_eq!(provider.calls(), vec!["update aws_db_instance.app"]);
        assert_eq!(result.summary.updated, 1);
    }

    #[test]
    fn test_destroy_is_reverse_of_apply() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id()).with_options(sequential());

        engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap();
        let created: Vec<String> = provider
            .calls()
            .iter()
            .map(|c| c.trim_start_matches("create ").to_string())
            .collect();
        provider.clear();

        let result = engine.reconcile(&fleet(), Mode::Destroy, &vars()).unwrap();
        let deleted: Vec<String> = provider
            .calls()
            .iter()
            .map(|c| c.trim_start_matches("delete ").to_string())
            .collect();

        let mut expected = created;
        expected.reverse();
        assert_eq!(deleted, expected);
        assert!(result.outputs.is_empty());
        assert!(backend.stored(&id()).unwrap().is_empty());
    }

    #[test]
    fn test_destroy_with_empty_state_does_nothing() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());

        let result = engine.reconcile(&fleet(), Mode::Destroy, &vars()).unwrap();
        assert!(provider.calls().is_empty());
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_failure_keeps_earlier_stages_and_stops() {
        let provider = provider().failing("aws_instance.web_1");
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id()).with_options(sequential());

        let err = engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap_err();
        match err {
            Error::Provision { resource, .. } => assert_eq!(resource, "aws_instance.web_1"),
            other => panic!("expected provision error, got {other:?}"),
        }

        let stored = backend.stored(&id()).unwrap();
        assert!(stored.get(&Address::new("aws_security_group", "web")).is_some());
        assert!(stored.get(&Address::new("aws_db_instance", "app")).is_some());
        assert!(stored.get(&Address::new("aws_instance", "web_1")).is_none());
        // web_2 sorts after web_1 in the same stage and is never attempted
        assert!(!provider.calls().contains(&"create aws_instance.web_2".to_string()));
        assert!(backend.lock_info(&id()).unwrap().is_none(), "lock must be released");
    }

    #[test]
    fn test_parallel_stage_records_every_success() {
        let provider = provider().failing("aws_instance.web_1");
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id()).with_options(ReconcileOptions { jobs: 4 });

        assert!(engine.reconcile(&fleet(), Mode::Apply, &vars()).is_err());
        let stored = backend.stored(&id()).unwrap();
        assert!(stored.get(&Address::new("aws_instance", "web_2")).is_some());
    }

    #[test]
    fn test_held_lock_fails_fast_without_mutation() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());

        let _held = StateLock::acquire(&backend, &id(), "apply").unwrap();
        let err = engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap_err();

        assert!(matches!(err, Error::State(StateError::Locked { .. })));
        assert!(err.is_pre_execution());
        assert!(provider.calls().is_empty());
        assert_eq!(backend.writes(), 0);
    }

    #[test]
    fn test_invalid_graph_fails_before_locking() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());

        let specs = vec![
            ResourceSpec::new("a", "x").depends_on("a.y"),
            ResourceSpec::new("a", "y").depends_on("a.x"),
        ];
        let err = engine.reconcile(&specs, Mode::Apply, &vars()).unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
        assert_eq!(backend.writes(), 0);
    }

    #[test]
    fn test_orphans_are_deleted_on_apply() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());
        engine.reconcile(&fleet(), Mode::Apply, &vars()).unwrap();
        provider.clear();

        let mut specs = fleet();
        specs.retain(|s| s.name != "web_2");
        let result = engine.reconcile(&specs, Mode::Apply, &vars()).unwrap();

        assert_eq!(provider.calls(), vec!["delete aws_instance.web_2"]);
        assert_eq!(
            result.outputs.get("ec2_public_ips"),
            Some(&OutputValue::List(vec!["1.2.3.4".into()]))
        );
    }

    #[test]
    fn test_plan_does_not_lock_or_write() {
        let provider = provider();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());

        let _held = StateLock::acquire(&backend, &id(), "apply").unwrap();
        let plan = engine.plan(&fleet(), Mode::Apply, &vars()).unwrap();
        assert_eq!(plan.summary().created, 4);
        assert!(provider.calls().is_empty());
        assert_eq!(backend.writes(), 0);
    }

    #[test]
    fn test_missing_output_attribute_is_omitted() {
        let provider = RecordingProvider::new();
        let backend = MemoryBackend::default();
        let engine = Engine::new(&provider, &backend, id());

        let specs = vec![
            ResourceSpec::new("aws_instance", "web").with_output(OutputBinding::list("ips", "public_ip")),
            ResourceSpec::new("aws_db_instance", "db").with_output(OutputBinding::scalar("db", "endpoint")),
        ];
        let result = engine.reconcile(&specs, Mode::Apply, &VarMap::new()).unwrap();

        assert_eq!(result.outputs.get("ips"), Some(&OutputValue::List(Vec::new())));
        assert!(!result.outputs.contains_key("db"));
    }
}
