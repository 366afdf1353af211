//! Resource dependency graph - validation and topological staging

use crate::error::GraphError;
use crate::reference::{self, Reference};
use crate::types::{Address, OutputBinding, ResourceSpec, VarMap};
use std::collections::{BTreeMap, BTreeSet};

/// Dependency edges: resource -> the resources it depends on
pub type Dependencies = BTreeMap<Address, BTreeSet<Address>>;

/// A validated, acyclic resource graph layered into stages
///
/// Stage `n` only depends on stages `< n`, so resources inside one stage are
/// independent of each other. Addresses within a stage are sorted, which
/// makes the flattened order deterministic.
#[derive(Debug)]
pub struct ResourceGraph<'a> {
    specs: BTreeMap<Address, &'a ResourceSpec>,
    dependencies: Dependencies,
    stages: Vec<Vec<Address>>,
}

impl<'a> ResourceGraph<'a> {
    /// Build and validate the graph.
    ///
    /// Edges come from explicit `depends_on` entries and from every
    /// `${TYPE.NAME.ATTR}` reference in the attributes.
    pub fn build(specs: &'a [ResourceSpec], vars: &VarMap) -> Result<Self, GraphError> {
        let mut nodes: BTreeMap<Address, &'a ResourceSpec> = BTreeMap::new();
        for spec in specs {
            let address = spec.address()?;
            if nodes.contains_key(&address) {
                return Err(GraphError::DuplicateResource(address.to_string()));
            }
            nodes.insert(address, spec);
        }

        let mut dependencies = Dependencies::new();
        for (address, spec) in &nodes {
            let deps = collect_dependencies(address, spec, &nodes, vars)?;
            if deps.contains(address) {
                return Err(GraphError::Cycle {
                    cycle: vec![address.to_string(), address.to_string()],
                });
            }
            dependencies.insert(address.clone(), deps);
        }

        validate_outputs(&nodes)?;
        let stages = stages_for(&dependencies)?;

        Ok(Self {
            specs: nodes,
            dependencies,
            stages,
        })
    }

    /// Stages in apply order
    pub fn stages(&self) -> &[Vec<Address>] {
        &self.stages
    }

    /// Stages in destroy order: the exact reverse of the apply order
    pub fn destroy_stages(&self) -> Vec<Vec<Address>> {
        self.stages
            .iter()
            .rev()
            .map(|stage| stage.iter().rev().cloned().collect())
            .collect()
    }

    /// Flattened topological order
    pub fn apply_order(&self) -> Vec<Address> {
        self.stages.iter().flatten().cloned().collect()
    }

    /// Flattened reverse topological order
    pub fn destroy_order(&self) -> Vec<Address> {
        self.destroy_stages().into_iter().flatten().collect()
    }

    pub fn spec(&self, address: &Address) -> Option<&'a ResourceSpec> {
        self.specs.get(address).copied()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.specs.contains_key(address)
    }

    /// Direct dependencies of a resource
    pub fn dependencies_of(&self, address: &Address) -> Vec<Address> {
        self.dependencies
            .get(address)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Output bindings in topological order
    pub fn output_bindings(&self) -> Vec<(&Address, &'a OutputBinding)> {
        self.stages
            .iter()
            .flatten()
            .filter_map(|address| self.specs.get_key_value(address))
            .flat_map(|(address, spec)| spec.outputs.iter().map(move |b| (address, b)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn collect_dependencies(
    address: &Address,
    spec: &ResourceSpec,
    nodes: &BTreeMap<Address, &ResourceSpec>,
    vars: &VarMap,
) -> Result<BTreeSet<Address>, GraphError> {
    let mut deps = BTreeSet::new();

    for raw in &spec.depends_on {
        let dep: Address = raw.parse()?;
        if !nodes.contains_key(&dep) {
            return Err(GraphError::UnknownDependency {
                resource: address.to_string(),
                dependency: dep.to_string(),
            });
        }
        deps.insert(dep);
    }

    for value in spec.attributes.values() {
        let found = reference::scan(value).map_err(|raw| GraphError::InvalidReference {
            resource: address.to_string(),
            reference: raw,
        })?;
        for reference in found {
            match reference {
                Reference::Var(name) => {
                    if !vars.contains_key(&name) {
                        return Err(GraphError::UnknownVariable {
                            resource: address.to_string(),
                            name,
                        });
                    }
                }
                Reference::Attribute { address: dep, .. } => {
                    if !nodes.contains_key(&dep) {
                        return Err(GraphError::UnknownDependency {
                            resource: address.to_string(),
                            dependency: dep.to_string(),
                        });
                    }
                    deps.insert(dep);
                }
            }
        }
    }

    Ok(deps)
}

fn validate_outputs(nodes: &BTreeMap<Address, &ResourceSpec>) -> Result<(), GraphError> {
    // output name -> (is list, first binding resource)
    let mut seen: BTreeMap<&str, (bool, &Address)> = BTreeMap::new();

    for (address, spec) in nodes {
        for binding in &spec.outputs {
            match seen.get(binding.name.as_str()) {
                None => {
                    seen.insert(&binding.name, (binding.list, address));
                }
                Some((list, _)) if *list != binding.list => {
                    return Err(GraphError::MixedOutputKinds {
                        name: binding.name.clone(),
                    });
                }
                Some((false, first)) => {
                    return Err(GraphError::ConflictingOutput {
                        name: binding.name.clone(),
                        first: first.to_string(),
                        second: address.to_string(),
                    });
                }
                Some((true, _)) => {}
            }
        }
    }

    Ok(())
}

/// Layer a dependency map into stages (Kahn's algorithm).
///
/// Dependencies that are not keys of the map are ignored, so a subset of a
/// larger graph can be staged directly.
pub fn stages_for(dependencies: &Dependencies) -> Result<Vec<Vec<Address>>, GraphError> {
    let mut pending: BTreeMap<&Address, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&Address, Vec<&Address>> = BTreeMap::new();

    for (address, deps) in dependencies {
        let inside: Vec<&Address> = deps
            .iter()
            .filter(|d| dependencies.contains_key(*d))
            .collect();
        pending.insert(address, inside.len());
        for dep in inside {
            dependents.entry(dep).or_default().push(address);
        }
    }

    let mut ready: Vec<&Address> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(address, _)| *address)
        .collect();
    let mut stages = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort();
        let mut next = Vec::new();
        for address in &ready {
            for dependent in dependents.get(address).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        stages.push(ready.iter().map(|a| (*a).clone()).collect());
        ready = next;
    }

    if placed < dependencies.len() {
        let stuck: BTreeSet<&Address> = pending
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(address, _)| *address)
            .collect();
        return Err(GraphError::Cycle {
            cycle: find_cycle(dependencies, &stuck),
        });
    }

    Ok(stages)
}

/// Walk dependency edges among unplaced nodes until one repeats
fn find_cycle(dependencies: &Dependencies, stuck: &BTreeSet<&Address>) -> Vec<String> {
    let Some(start) = stuck.iter().next().copied() else {
        return Vec::new();
    };

    let mut path: Vec<&Address> = vec![start];
    let mut current = start;
    while let Some(next) = dependencies
        .get(current)
        .and_then(|deps| deps.iter().find(|d| stuck.contains(d)))
    {
        if let Some(pos) = path.iter().position(|a| *a == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }

    path.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(addresses: &[Address]) -> Vec<String> {
        addresses.iter().map(ToString::to_string).collect()
    }

    /// vpc <- subnet_a, subnet_b <- instance (diamond)
    fn diamond() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("aws_instance", "web")
                .with_attribute("subnet", "${aws_subnet.a.id}")
                .depends_on("aws_subnet.b"),
            ResourceSpec::new("aws_subnet", "b").with_attribute("vpc", "${aws_vpc.main.id}"),
            ResourceSpec::new("aws_subnet", "a").with_attribute("vpc", "${aws_vpc.main.id}"),
            ResourceSpec::new("aws_vpc", "main").with_attribute("cidr", "10.0.0.0/16"),
        ]
    }

    #[test]
    fn test_stages_of_diamond() {
        let specs = diamond();
        let graph = ResourceGraph::build(&specs, &VarMap::new()).unwrap();

        let stages: Vec<Vec<String>> = graph.stages().iter().map(|s| names(s)).collect();
        assert_eq!(
            stages,
            vec![
                vec!["aws_vpc.main".to_string()],
                vec!["aws_subnet.a".to_string(), "aws_subnet.b".to_string()],
                vec!["aws_instance.web".to_string()],
            ]
        );
    }

    #[test]
    fn test_destroy_order_is_reverse_of_apply_order() {
        let fixtures = vec![
            diamond(),
            vec![
                ResourceSpec::new("a", "one"),
                ResourceSpec::new("a", "two").depends_on("a.one"),
                ResourceSpec::new("a", "three").depends_on("a.two"),
                ResourceSpec::new("b", "free"),
            ],
            vec![],
        ];

        for specs in &fixtures {
            let graph = ResourceGraph::build(specs, &VarMap::new()).unwrap();
            let mut reversed = graph.apply_order();
            reversed.reverse();
            assert_eq!(graph.destroy_order(), reversed);
        }
    }

    #[test]
    fn test_every_dependency_precedes_dependent() {
        let specs = diamond();
        let graph = ResourceGraph::build(&specs, &VarMap::new()).unwrap();
        let order = graph.apply_order();

        for (index, address) in order.iter().enumerate() {
            for dep in graph.dependencies_of(address) {
                let dep_index = order.iter().position(|a| *a == dep).unwrap();
                assert!(dep_index < index, "{dep} must come before {address}");
            }
        }
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let specs = vec![
            ResourceSpec::new("a", "x").depends_on("a.y"),
            ResourceSpec::new("a", "y").with_attribute("ref", "${a.z.id}"),
            ResourceSpec::new("a", "z").depends_on("a.x"),
            ResourceSpec::new("a", "free"),
        ];
        match ResourceGraph::build(&specs, &VarMap::new()) {
            Err(GraphError::Cycle { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                assert!(!cycle.contains(&"a.free".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let specs = vec![ResourceSpec::new("a", "x").with_attribute("me", "${a.x.id}")];
        assert!(matches!(
            ResourceGraph::build(&specs, &VarMap::new()),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_dependency() {
        let specs = vec![ResourceSpec::new("a", "x"), ResourceSpec::new("a", "x")];
        assert!(matches!(
            ResourceGraph::build(&specs, &VarMap::new()),
            Err(GraphError::DuplicateResource(_))
        ));

        let specs = vec![ResourceSpec::new("a", "x").depends_on("a.missing")];
        assert!(matches!(
            ResourceGraph::build(&specs, &VarMap::new()),
            Err(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_variable() {
        let specs = vec![ResourceSpec::new("aws_instance", "web").with_attribute("ami", "${var.ami_id}")];
        assert!(matches!(
            ResourceGraph::build(&specs, &VarMap::new()),
            Err(GraphError::UnknownVariable { .. })
        ));

        let mut vars = VarMap::new();
        vars.insert("ami_id".into(), json!("ami-1"));
        assert!(ResourceGraph::build(&specs, &vars).is_ok());
    }

    #[test]
    fn test_output_binding_validation() {
        let specs = vec![
            ResourceSpec::new("a", "x").with_output(OutputBinding::scalar("db", "endpoint")),
            ResourceSpec::new("a", "y").with_output(OutputBinding::scalar("db", "endpoint")),
        ];
        assert!(matches!(
            ResourceGraph::build(&specs, &VarMap::new()),
            Err(GraphError::ConflictingOutput { .. })
        ));

        let specs = vec![
            ResourceSpec::new("a", "x").with_output(OutputBinding::list("ips", "ip")),
            ResourceSpec::new("a", "y").with_output(OutputBinding::scalar("ips", "ip")),
        ];
        assert!(matches!(
            ResourceGraph::build(&specs, &VarMap::new()),
            Err(GraphError::MixedOutputKinds { .. })
        ));

        let specs = vec![
            ResourceSpec::new("a", "x").with_output(OutputBinding::list("ips", "ip")),
            ResourceSpec::new("a", "y").with_output(OutputBinding::list("ips", "ip")),
        ];
        let graph = ResourceGraph::build(&specs, &VarMap::new()).unwrap();
        assert_eq!(graph.output_bindings().len(), 2);
    }

    #[test]
    fn test_stages_for_ignores_external_edges() {
        let mut deps = Dependencies::new();
        deps.insert(
            Address::new("a", "x"),
            BTreeSet::from([Address::new("gone", "elsewhere")]),
        );
        deps.insert(Address::new("a", "y"), BTreeSet::from([Address::new("a", "x")]));

        let stages = stages_for(&deps).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(names(&stages[0]), vec!["a.x"]);
    }
}
