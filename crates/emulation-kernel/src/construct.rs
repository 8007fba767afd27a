//! Graph construction: run resolved components against the experiment graph.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::ConstructError;
use crate::graph::{ExperimentGraph, FrozenGraph};
use crate::resolver::{Resolution, RootRequest};

/// What a unit sees of the component it runs for.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub component: String,
    pub positional: Vec<String>,
    pub named: BTreeMap<String, String>,
    /// Resource files declared by the component, already resolved to paths
    pub resources: BTreeMap<String, PathBuf>,
}

impl UnitContext {
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.named.get(key).map(String::as_str)
    }

    pub fn resource(&self, key: &str) -> Option<&PathBuf> {
        self.resources.get(key)
    }
}

/// Code invoked while a component is executed during graph construction.
pub trait ComponentUnit: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> anyhow::Result<()>;
}

/// Units addressable from component descriptors by name.
#[derive(Clone, Default)]
pub struct UnitTable {
    units: BTreeMap<String, Arc<dyn ComponentUnit>>,
}

impl std::fmt::Debug for UnitTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitTable")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, unit: impl ComponentUnit + 'static) -> Self {
        self.units.insert(unit.name().to_string(), Arc::new(unit));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ComponentUnit>> {
        self.units.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }
}

/// Execute every resolved component in order and freeze the result.
///
/// Unit references are checked up front so a missing unit fails before any
/// component has touched the graph.
pub fn construct_graph(
    resolution: &Resolution,
    units: &UnitTable,
) -> Result<FrozenGraph, ConstructError> {
    for component in &resolution.order {
        if let Some(unit) = &component.descriptor.unit
            && !units.contains(unit)
        {
            return Err(ConstructError::UnknownUnit {
                component: component.name().to_string(),
                unit: unit.clone(),
            });
        }
    }

    let mut graph = ExperimentGraph::new();
    for component in &resolution.order {
        let Some(unit_name) = &component.descriptor.unit else {
            debug!(component = %component.name(), "Component has no unit, skipping");
            continue;
        };
        let Some(unit) = units.get(unit_name) else {
            continue;
        };

        let request = component.request.clone().unwrap_or_else(|| RootRequest::new(component.name()));
        let ctx = UnitContext {
            component: component.name().to_string(),
            positional: request.positional,
            named: request.named,
            resources: component.descriptor.resources.clone(),
        };

        debug!(component = %ctx.component, unit = %unit_name, "Running component unit");
        unit.build(&mut graph, &ctx)
            .map_err(|source| ConstructError::UnitFailed {
                component: ctx.component.clone(),
                source,
            })?;
    }

    info!(
        components = resolution.order.len(),
        vertices = graph.vertex_count(),
        edges = graph.edge_count(),
        "Experiment graph constructed"
    );
    Ok(graph.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ComponentDescriptor, ComponentRegistry};
    use crate::resolver::{CapabilityBindings, Resolver};

    struct AddHost;

    impl ComponentUnit for AddHost {
        fn name(&self) -> &str {
            "add-host"
        }

        fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> anyhow::Result<()> {
            let name = ctx.arg("name").unwrap_or(&ctx.component);
            graph.add_vertex(name, "host")?;
            Ok(())
        }
    }

    struct Decorate;

    impl ComponentUnit for Decorate {
        fn name(&self) -> &str {
            "decorate"
        }

        fn build(&self, graph: &mut ExperimentGraph, _ctx: &UnitContext) -> anyhow::Result<()> {
            let id = graph
                .find_vertex("h1")
                .ok_or_else(|| anyhow::anyhow!("h1 must exist"))?;
            graph.decorate_vertex(id, "vm")?;
            Ok(())
        }
    }

    fn resolve(registry: &ComponentRegistry, roots: &[&str]) -> Resolution {
        let defaults = CapabilityBindings::new();
        let roots: Vec<RootRequest> = roots.iter().map(|r| r.parse().unwrap()).collect();
        Resolver::new(registry, &defaults).resolve(&roots).unwrap()
    }

    #[test]
    fn components_run_in_resolved_order() {
        let registry = ComponentRegistry::from_descriptors([
            ComponentDescriptor::new("hosts").provides("graph").with_unit("add-host"),
            ComponentDescriptor::new("vm")
                .depends_on_capability("graph")
                .with_unit("decorate"),
        ])
        .unwrap();
        let units = UnitTable::new().register(AddHost).register(Decorate);

        let resolution = resolve(&registry, &["vm", "hosts:name=h1"]);
        let graph = construct_graph(&resolution, &units).unwrap();
        assert!(graph.find_vertex("h1").unwrap().has("vm"));
    }

    #[test]
    fn unknown_unit_fails_before_building() {
        let registry = ComponentRegistry::from_descriptors([
            ComponentDescriptor::new("a").with_unit("missing"),
        ])
        .unwrap();
        let resolution = resolve(&registry, &["a"]);
        let err = construct_graph(&resolution, &UnitTable::new()).unwrap_err();
        assert!(matches!(err, ConstructError::UnknownUnit { unit, .. } if unit == "missing"));
    }

    #[test]
    fn unit_failure_names_the_component() {
        let registry = ComponentRegistry::from_descriptors([
            ComponentDescriptor::new("broken").with_unit("decorate"),
        ])
        .unwrap();
        let units = UnitTable::new().register(Decorate);
        let resolution = resolve(&registry, &["broken"]);
        let err = construct_graph(&resolution, &units).unwrap_err();
        assert!(err.to_string().contains("`broken`"));
    }
}
