//! In-memory experiment topology.
//!
//! The graph is mutable only while resolved components run, strictly one at a
//! time. [`ExperimentGraph::freeze`] consumes it and hands out a read-only
//! [`FrozenGraph`] that is cheap to share across the scheduler and handlers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::schedule::{Action, EntryId, Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A named node of the topology, e.g. a virtual machine or a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    pub name: String,
    pub kind: String,
    /// Behavior mixins attached by components; append-only
    pub decorations: BTreeSet<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Present once anything was scheduled on this vertex
    pub schedule: Option<Schedule>,
}

impl Vertex {
    pub fn has(&self, decoration: &str) -> bool {
        self.decorations.contains(decoration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub endpoints: (VertexId, VertexId),
    pub decorations: BTreeSet<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Graph under construction.
#[derive(Debug, Clone, Default)]
pub struct ExperimentGraph {
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    names: BTreeMap<String, VertexId>,
}

impl ExperimentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex, reserving its name for the lifetime of the graph.
    pub fn add_vertex(
        &mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<VertexId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateVertex(name));
        }
        let id = VertexId(self.vertices.len() as u32);
        self.names.insert(name.clone(), id);
        self.vertices.push(Vertex {
            id,
            name,
            kind: kind.into(),
            decorations: BTreeSet::new(),
            attributes: BTreeMap::new(),
            schedule: None,
        });
        Ok(id)
    }

    pub fn add_edge(
        &mut self,
        a: VertexId,
        b: VertexId,
        attributes: BTreeMap<String, serde_json::Value>,
    ) -> Result<EdgeId, GraphError> {
        self.check(a)?;
        self.check(b)?;
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            id,
            endpoints: (a, b),
            decorations: BTreeSet::new(),
            attributes,
        });
        Ok(id)
    }

    fn check(&self, id: VertexId) -> Result<(), GraphError> {
        if (id.0 as usize) < self.vertices.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownVertex(id.to_string()))
        }
    }

    fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Vertex, GraphError> {
        self.vertices
            .get_mut(id.0 as usize)
            .ok_or_else(|| GraphError::UnknownVertex(id.to_string()))
    }

    pub fn find_vertex(&self, name: &str) -> Option<VertexId> {
        self.names.get(name).copied()
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id.0 as usize)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0 as usize)
    }

    /// First edge joining `a` and `b`, in either orientation.
    pub fn find_edge(&self, a: VertexId, b: VertexId) -> Option<EdgeId> {
        self.edges
            .iter()
            .find(|e| e.endpoints == (a, b) || e.endpoints == (b, a))
            .map(|e| e.id)
    }

    pub fn decorate_vertex(&mut self, id: VertexId, decoration: &str) -> Result<(), GraphError> {
        self.vertex_mut(id)?.decorations.insert(decoration.to_string());
        Ok(())
    }

    pub fn decorate_edge(&mut self, id: EdgeId, decoration: &str) -> Result<(), GraphError> {
        let edge = self
            .edges
            .get_mut(id.0 as usize)
            .ok_or_else(|| GraphError::UnknownEdge(id.to_string()))?;
        edge.decorations.insert(decoration.to_string());
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        id: VertexId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), GraphError> {
        self.vertex_mut(id)?.attributes.insert(key.to_string(), value);
        Ok(())
    }

    /// Vertices carrying `decoration`, in creation order.
    pub fn vertices_with(&self, decoration: &str) -> Vec<VertexId> {
        self.vertices
            .iter()
            .filter(|v| v.has(decoration))
            .map(|v| v.id)
            .collect()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn schedule_action(
        &mut self,
        id: VertexId,
        start_time: f64,
        action: Action,
    ) -> Result<EntryId, GraphError> {
        let vertex = self.vertex_mut(id)?;
        let owner = vertex.name.clone();
        vertex
            .schedule
            .get_or_insert_with(|| Schedule::new(owner))
            .schedule_action(start_time, action)
    }

    pub fn freeze(self) -> FrozenGraph {
        FrozenGraph {
            inner: Arc::new(self),
        }
    }
}

/// Read-only view of a finished graph.
#[derive(Debug, Clone)]
pub struct FrozenGraph {
    inner: Arc<ExperimentGraph>,
}

impl FrozenGraph {
    pub fn find_vertex(&self, name: &str) -> Option<&Vertex> {
        self.inner
            .find_vertex(name)
            .and_then(|id| self.inner.vertex(id))
    }

    pub fn find_edge(&self, a: &str, b: &str) -> Option<&Edge> {
        let a = self.inner.find_vertex(a)?;
        let b = self.inner.find_vertex(b)?;
        self.inner.find_edge(a, b).and_then(|id| self.inner.edge(id))
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.inner.vertices.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.inner.edges.iter()
    }

    pub fn vertex_count(&self) -> usize {
        self.inner.vertex_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Schedules of every vertex that has one, keyed by vertex name.
    ///
    /// Vertices with nothing scheduled do not take part in the barrier.
    pub fn schedules(&self) -> BTreeMap<String, Schedule> {
        self.inner
            .vertices
            .iter()
            .filter_map(|v| v.schedule.clone().map(|s| (v.name.clone(), s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_names_are_unique() {
        let mut graph = ExperimentGraph::new();
        graph.add_vertex("h1", "host").unwrap();
        assert_eq!(
            graph.add_vertex("h1", "host"),
            Err(GraphError::DuplicateVertex("h1".into()))
        );
    }

    #[test]
    fn edges_only_join_existing_vertices() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex("a", "host").unwrap();
        let b = graph.add_vertex("b", "host").unwrap();
        let e = graph.add_edge(a, b, BTreeMap::new()).unwrap();
        assert_eq!(graph.find_edge(b, a), Some(e));
        assert!(graph.add_edge(a, VertexId(9), BTreeMap::new()).is_err());
    }

    #[test]
    fn decoration_queries() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex("a", "host").unwrap();
        let b = graph.add_vertex("b", "switch").unwrap();
        graph.decorate_vertex(a, "vm").unwrap();
        graph.decorate_vertex(a, "vm").unwrap();
        graph.decorate_vertex(b, "tap").unwrap();
        assert_eq!(graph.vertices_with("vm"), vec![a]);
        assert_eq!(graph.vertex(a).unwrap().decorations.len(), 1);
    }

    #[test]
    fn frozen_graph_exposes_schedules() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex("a", "host").unwrap();
        graph.add_vertex("idle", "host").unwrap();
        graph
            .schedule_action(a, -1.0, Action::Pause { duration: 1.0 })
            .unwrap();

        let frozen = graph.freeze();
        let schedules = frozen.schedules();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules["a"].owner(), "a");
        assert!(frozen.find_vertex("idle").unwrap().schedule.is_none());
    }
}
