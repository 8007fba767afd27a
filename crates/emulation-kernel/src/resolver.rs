//! Dependency resolution: requested roots → one linear execution order.
//!
//! Resolution runs in three passes over a per-run working set:
//!
//! ```text
//! roots ──► expand (capability + component depends, to a fixed point)
//!       ──► precedes edges among the closed set
//!       ──► Kahn drain keyed by (root position, name) ──► order | cycle
//! ```
//!
//! The result is a pure function of the roots, the registry snapshot and the
//! capability defaults, so a dry run prints exactly the order a real run uses.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::error::ResolveError;
use crate::registry::{ComponentDescriptor, ComponentRegistry, ProviderLookup};

/// Capability → component chosen when several components provide it.
pub type CapabilityBindings = BTreeMap<String, String>;

/// Placeholder used as the referencing component for unknown roots.
const ROOTS: &str = "<requested roots>";

/// One requested root component with its (opaque) arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootRequest {
    pub name: String,
    #[serde(default)]
    pub positional: Vec<String>,
    #[serde(default)]
    pub named: BTreeMap<String, String>,
}

impl RootRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid root request `{0}`: expected name[:arg,key=value,...]")]
pub struct ParseRootError(String);

impl FromStr for RootRequest {
    type Err = ParseRootError;

    /// Parse `name[:arg,arg,key=value,...]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = match s.split_once(':') {
            Some((name, rest)) => (name.trim(), Some(rest)),
            None => (s.trim(), None),
        };
        if name.is_empty() {
            return Err(ParseRootError(s.to_string()));
        }
        let mut request = RootRequest::new(name);
        for arg in rest.into_iter().flat_map(|r| r.split(',')) {
            let arg = arg.trim();
            if arg.is_empty() {
                continue;
            }
            match arg.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    request
                        .named
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                Some(_) => return Err(ParseRootError(s.to_string())),
                None => request.positional.push(arg.to_string()),
            }
        }
        Ok(request)
    }
}

impl fmt::Display for RootRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        let args: Vec<String> = self
            .positional
            .iter()
            .cloned()
            .chain(self.named.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        if !args.is_empty() {
            write!(f, ":{}", args.join(","))?;
        }
        Ok(())
    }
}

/// Why one component must run before another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeReason {
    Depends,
    CapabilityDepends(String),
    Precedes,
    CapabilityPrecedes(String),
}

impl fmt::Display for EdgeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Depends => write!(f, "depends"),
            Self::CapabilityDepends(cap) => write!(f, "provides `{cap}`"),
            Self::Precedes => write!(f, "precedes"),
            Self::CapabilityPrecedes(cap) => write!(f, "precedes providers of `{cap}`"),
        }
    }
}

/// A resolved ordering constraint: `before` runs strictly before `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEdge {
    pub before: String,
    pub after: String,
    pub reason: EdgeReason,
}

/// One entry of the resolved order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedComponent {
    pub descriptor: Arc<ComponentDescriptor>,
    /// Arguments when the component was requested as a root
    pub request: Option<RootRequest>,
    /// Smallest root position that reaches this component
    pub root_position: usize,
}

impl ResolvedComponent {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Output of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub order: Vec<ResolvedComponent>,
    pub edges: Vec<ResolvedEdge>,
}

impl Resolution {
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(ResolvedComponent::name).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|c| c.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

/// Per-run wrapper around a descriptor.
#[derive(Debug)]
struct ResolutionNode {
    descriptor: Arc<ComponentDescriptor>,
    root_position: usize,
    predecessors: BTreeSet<String>,
    state: VisitState,
}

/// Resolves root requests against a registry snapshot.
pub struct Resolver<'a> {
    registry: &'a ComponentRegistry,
    defaults: &'a CapabilityBindings,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ComponentRegistry, defaults: &'a CapabilityBindings) -> Self {
        Self { registry, defaults }
    }

    /// Compute the full execution order for `roots`.
    pub fn resolve(&self, roots: &[RootRequest]) -> Result<Resolution, ResolveError> {
        let mut requests: BTreeMap<String, (usize, RootRequest)> = BTreeMap::new();
        for root in roots {
            if requests.contains_key(&root.name) {
                warn!(component = %root.name, "Root listed more than once, keeping first");
                continue;
            }
            let position = requests.len();
            requests.insert(root.name.clone(), (position, root.clone()));
        }

        let mut nodes: BTreeMap<String, ResolutionNode> = BTreeMap::new();
        let mut edges: BTreeMap<(String, String), EdgeReason> = BTreeMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        let mut ordered_roots: Vec<(&usize, &String)> =
            requests.iter().map(|(name, (pos, _))| (pos, name)).collect();
        ordered_roots.sort();
        for (position, name) in ordered_roots {
            self.admit(ROOTS, name, *position, &mut nodes, &mut queue)?;
        }

        // Expansion to a fixed point. A node is re-queued whenever its root
        // position drops, so positions propagate to everything it pulled in.
        while let Some(name) = queue.pop_front() {
            let Some(node) = nodes.get_mut(&name) else {
                continue;
            };
            node.state = VisitState::InProgress;
            let (descriptor, position) = (node.descriptor.clone(), node.root_position);

            for capability in &descriptor.capability_depends {
                let provider = self.choose_provider(&name, capability, &requests)?;
                self.admit(&name, &provider, position, &mut nodes, &mut queue)?;
                add_edge(
                    &mut edges,
                    &mut nodes,
                    &provider,
                    &name,
                    EdgeReason::CapabilityDepends(capability.clone()),
                );
            }
            for dependency in &descriptor.component_depends {
                self.admit(&name, dependency, position, &mut nodes, &mut queue)?;
                add_edge(&mut edges, &mut nodes, dependency, &name, EdgeReason::Depends);
            }

            if let Some(node) = nodes.get_mut(&name) {
                node.state = VisitState::Done;
            }
        }

        // Precedes relations order members of the closed set but never pull
        // new components in.
        let members: Vec<String> = nodes.keys().cloned().collect();
        for name in &members {
            let descriptor = nodes[name].descriptor.clone();
            for capability in &descriptor.capability_precedes {
                for provider in self.registry.providers_of(capability) {
                    if provider != name && nodes.contains_key(provider) {
                        add_edge(
                            &mut edges,
                            &mut nodes,
                            name,
                            provider,
                            EdgeReason::CapabilityPrecedes(capability.clone()),
                        );
                    }
                }
            }
            for target in &descriptor.component_precedes {
                if !self.registry.contains(target) {
                    return Err(ResolveError::UnknownComponent {
                        component: name.clone(),
                        missing: target.clone(),
                    });
                }
                if nodes.contains_key(target) {
                    add_edge(&mut edges, &mut nodes, name, target, EdgeReason::Precedes);
                }
            }
        }

        let order = drain_in_order(&nodes)?;
        debug!(
            roots = requests.len(),
            components = order.len(),
            edges = edges.len(),
            "Resolution complete"
        );

        let order = order
            .into_iter()
            .map(|name| {
                let node = &nodes[&name];
                ResolvedComponent {
                    descriptor: node.descriptor.clone(),
                    request: requests.get(&name).map(|(_, r)| r.clone()),
                    root_position: node.root_position,
                }
            })
            .collect();
        let edges = edges
            .into_iter()
            .map(|((before, after), reason)| ResolvedEdge {
                before,
                after,
                reason,
            })
            .collect();

        Ok(Resolution { order, edges })
    }

    /// Add `name` to the working set, or lower its root position.
    fn admit(
        &self,
        referrer: &str,
        name: &str,
        position: usize,
        nodes: &mut BTreeMap<String, ResolutionNode>,
        queue: &mut VecDeque<String>,
    ) -> Result<(), ResolveError> {
        if let Some(node) = nodes.get_mut(name) {
            if position < node.root_position {
                node.root_position = position;
                if node.state != VisitState::Unvisited {
                    node.state = VisitState::Unvisited;
                    queue.push_back(name.to_string());
                }
            }
            return Ok(());
        }

        let descriptor =
            self.registry
                .get(name)
                .cloned()
                .ok_or_else(|| ResolveError::UnknownComponent {
                    component: referrer.to_string(),
                    missing: name.to_string(),
                })?;
        trace!(component = %name, referrer = %referrer, position, "Admitted component");
        nodes.insert(
            name.to_string(),
            ResolutionNode {
                descriptor,
                root_position: position,
                predecessors: BTreeSet::new(),
                state: VisitState::Unvisited,
            },
        );
        queue.push_back(name.to_string());
        Ok(())
    }

    /// Pick the single provider of `capability` for `requester`.
    fn choose_provider(
        &self,
        requester: &str,
        capability: &str,
        requests: &BTreeMap<String, (usize, RootRequest)>,
    ) -> Result<String, ResolveError> {
        match self.registry.lookup(capability, requester) {
            ProviderLookup::None => Err(ResolveError::UnsatisfiedCapability {
                component: requester.to_string(),
                capability: capability.to_string(),
            }),
            ProviderLookup::Unique(provider) => Ok(provider.to_string()),
            ProviderLookup::Ambiguous(candidates) => {
                let owned = || candidates.iter().map(|c| c.to_string()).collect::<Vec<_>>();
                if let Some(default) = self.defaults.get(capability) {
                    return if candidates.contains(&default.as_str()) {
                        debug!(capability, provider = %default, "Capability bound by default");
                        Ok(default.clone())
                    } else {
                        Err(ResolveError::InvalidDefault {
                            capability: capability.to_string(),
                            component: default.clone(),
                            candidates: owned(),
                        })
                    };
                }
                let listed: Vec<&&str> = candidates
                    .iter()
                    .filter(|c| requests.contains_key(**c))
                    .collect();
                match listed.as_slice() {
                    [only] => Ok(only.to_string()),
                    _ => Err(ResolveError::AmbiguousCapability {
                        capability: capability.to_string(),
                        candidates: owned(),
                    }),
                }
            }
        }
    }
}

fn add_edge(
    edges: &mut BTreeMap<(String, String), EdgeReason>,
    nodes: &mut BTreeMap<String, ResolutionNode>,
    before: &str,
    after: &str,
    reason: EdgeReason,
) {
    edges
        .entry((before.to_string(), after.to_string()))
        .or_insert(reason);
    if let Some(node) = nodes.get_mut(after) {
        node.predecessors.insert(before.to_string());
    }
}

/// Kahn's algorithm over the closed set.
///
/// The ready set only ever holds nodes whose unresolved in-degree is zero, so
/// the ordering key reduces to (root position, name).
fn drain_in_order(nodes: &BTreeMap<String, ResolutionNode>) -> Result<Vec<String>, ResolveError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut successors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (name, node) in nodes {
        in_degree.insert(name, node.predecessors.len());
        for pred in &node.predecessors {
            successors.entry(pred.as_str()).or_default().insert(name);
        }
    }

    let mut ready: BTreeSet<(usize, &str)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| (nodes[*name].root_position, *name))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, name)) = ready.pop_first() {
        order.push(name.to_string());
        for succ in successors.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(succ) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((nodes[*succ].root_position, *succ));
                }
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let stuck: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(name, _)| *name)
        .collect();
    let cycle = shortest_cycle(&stuck, &successors);
    warn!(cycle = ?cycle, "Dependency cycle detected");
    Err(ResolveError::CyclicDependency { cycle })
}

/// Shortest cycle among the nodes Kahn could not drain.
fn shortest_cycle(
    stuck: &BTreeSet<&str>,
    successors: &BTreeMap<&str, BTreeSet<&str>>,
) -> Vec<String> {
    let mut best: Option<Vec<String>> = None;

    for &start in stuck {
        let mut parent: BTreeMap<&str, &str> = BTreeMap::new();
        let mut frontier: VecDeque<&str> = VecDeque::from([start]);
        let mut seen: BTreeSet<&str> = BTreeSet::from([start]);
        let mut closing: Option<&str> = None;

        'bfs: while let Some(current) = frontier.pop_front() {
            for &next in successors.get(current).into_iter().flatten() {
                if !stuck.contains(next) {
                    continue;
                }
                if next == start {
                    closing = Some(current);
                    break 'bfs;
                }
                if seen.insert(next) {
                    parent.insert(next, current);
                    frontier.push_back(next);
                }
            }
        }

        let Some(mut cursor) = closing else {
            continue;
        };
        let mut path = vec![cursor.to_string()];
        while cursor != start {
            cursor = parent[cursor];
            path.push(cursor.to_string());
        }
        path.reverse();

        if best.as_ref().is_none_or(|b| path.len() < b.len()) {
            best = Some(path);
        }
    }

    best.unwrap_or_else(|| stuck.iter().map(|s| s.to_string()).collect())
}
