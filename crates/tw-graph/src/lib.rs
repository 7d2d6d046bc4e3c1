#![forbid(unsafe_code)]

//! Computation-graph extraction driven by forward hooks.
//!
//! Every leaf submodule of a watched model gets a hook that records one node
//! the first time the submodule runs. Edges connect a node to the nodes whose
//! output tensors it consumed.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use serde::{Serialize, Serializer};
use tracing::debug;
use tw_nn::{ForwardEvent, HookHandle, Module, ModuleId, Parameter, named_parameters};
use tw_shape::{ShapeDescriptor, collect_tensors, nested_shape};

pub const GRAPH_FORMAT: &str = "torch";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: u64,
    pub name: String,
    pub class_name: String,
    pub parameters: Vec<(String, Vec<usize>)>,
    pub num_parameters: Vec<usize>,
    pub input_shape: ShapeDescriptor,
    pub output_shape: ShapeDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GraphEdge {
    pub from: u64,
    pub to: u64,
}

/// Shared handle to a graph that hooks keep filling in.
pub type GraphHandle = Rc<RefCell<TorchGraph>>;

/// Called once, when every hooked submodule has run.
pub type CompletionHook = Rc<dyn Fn(&TorchGraph)>;

#[derive(Debug, Default)]
pub struct TorchGraph {
    graph_idx: usize,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    edge_set: HashSet<GraphEdge>,
    hooked: BTreeSet<ModuleId>,
    pending: BTreeSet<ModuleId>,
    // Tensor id -> node that most recently produced it.
    producers: HashMap<u64, u64>,
    published: bool,
}

struct LeafInfo {
    name: String,
    class_name: String,
    parameters: Vec<(String, Parameter)>,
}

impl TorchGraph {
    #[must_use]
    pub fn new(graph_idx: usize) -> Self {
        Self {
            graph_idx,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn shared(graph_idx: usize) -> GraphHandle {
        Rc::new(RefCell::new(Self::new(graph_idx)))
    }

    #[must_use]
    pub fn graph_idx(&self) -> usize {
        self.graph_idx
    }

    /// Summary key the completed graph is published under.
    #[must_use]
    pub fn summary_key(&self) -> String {
        format!("graph_{}", self.graph_idx)
    }

    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    #[must_use]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether at least one submodule was hooked and all of them have run.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.hooked.is_empty() && self.pending.is_empty()
    }

    pub fn to_graph_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Installs a recording hook on every leaf submodule of `model`.
    ///
    /// Children that are containers are walked with dotted name prefixes;
    /// unnamed children are named by position. `on_complete` runs once, after
    /// the last pending submodule records its node.
    pub fn hook_modules(
        graph: &GraphHandle,
        model: &dyn Module,
        on_complete: Option<CompletionHook>,
    ) -> Vec<HookHandle> {
        let mut handles = Vec::new();
        Self::hook_children(graph, model, "", &on_complete, &mut handles);
        debug!(
            graph_idx = graph.borrow().graph_idx,
            hooks = handles.len(),
            "graph hooks installed"
        );
        handles
    }

    fn hook_children(
        graph: &GraphHandle,
        module: &dyn Module,
        prefix: &str,
        on_complete: &Option<CompletionHook>,
        handles: &mut Vec<HookHandle>,
    ) {
        for (position, (name, child)) in module.named_children().into_iter().enumerate() {
            let name = if name.is_empty() {
                position.to_string()
            } else {
                name
            };
            let name = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}.{name}")
            };
            if child.is_container() {
                Self::hook_children(graph, child, &name, on_complete, handles);
                continue;
            }
            let info = LeafInfo {
                name,
                class_name: child.class_name(),
                parameters: named_parameters(child),
            };
            handles.push(Self::hook_leaf(graph, child, info, on_complete.clone()));
        }
    }

    fn hook_leaf(
        graph: &GraphHandle,
        module: &dyn Module,
        info: LeafInfo,
        on_complete: Option<CompletionHook>,
    ) -> HookHandle {
        {
            let mut inner = graph.borrow_mut();
            inner.hooked.insert(module.id());
            inner.pending.insert(module.id());
        }
        let graph = Rc::clone(graph);
        module.base().register_forward_hook(move |event| {
            let completed = match graph.try_borrow_mut() {
                Ok(mut inner) => inner.observe(event, &info),
                Err(_) => false,
            };
            if !completed {
                return;
            }
            if let (Some(on_complete), Ok(inner)) = (&on_complete, graph.try_borrow()) {
                on_complete(&inner);
            }
        })
    }

    // Returns true when this event completes the graph.
    fn observe(&mut self, event: &ForwardEvent<'_>, info: &LeafInfo) -> bool {
        let node_id = event.module.get();
        if self.pending.remove(&event.module) {
            let parameters = info
                .parameters
                .iter()
                .map(|(name, parameter)| (name.clone(), parameter.shape()))
                .collect::<Vec<_>>();
            let num_parameters = parameters
                .iter()
                .map(|(_, shape)| shape.iter().product())
                .collect();
            for tensor in collect_tensors(event.input) {
                if let Some(&from) = self.producers.get(&tensor.id()) {
                    self.add_edge(GraphEdge { from, to: node_id });
                }
            }
            self.nodes.push(GraphNode {
                id: node_id,
                name: info.name.clone(),
                class_name: info.class_name.clone(),
                parameters,
                num_parameters,
                input_shape: nested_shape(event.input),
                output_shape: nested_shape(event.output),
            });
        }
        for tensor in collect_tensors(event.output) {
            self.producers.insert(tensor.id(), node_id);
        }

        if self.pending.is_empty() && !self.published {
            self.published = true;
            debug!(
                graph_idx = self.graph_idx,
                nodes = self.nodes.len(),
                edges = self.edges.len(),
                "graph complete"
            );
            return true;
        }
        false
    }

    fn add_edge(&mut self, edge: GraphEdge) {
        if edge.from != edge.to && self.edge_set.insert(edge) {
            self.edges.push(edge);
        }
    }
}

#[derive(Serialize)]
struct GraphJson<'a> {
    format: &'static str,
    nodes: &'a [GraphNode],
    edges: &'a [GraphEdge],
}

impl Serialize for TorchGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GraphJson {
            format: GRAPH_FORMAT,
            nodes: &self.nodes,
            edges: &self.edges,
        }
        .serialize(serializer)
    }
}
