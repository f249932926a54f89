//! Nodes: kernel instances inside a graph.

#![forbid(unsafe_code)]

use crate::context::Context;
use crate::dispatch::Action;
use crate::error::{VxError, VxResult};
use crate::invariant_ppt::{assert_invariant, REPLICATION_ATOMIC};
use crate::kernel::{BorderMode, KernelAttributes, ParamDesc};
use crate::perf::Perf;
use crate::reference::{Counter, Object, Ref, RefType};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Completion callback. Runs after a node succeeds; returning [`Action::Abandon`]
/// stops the rest of the graph pass.
pub type NodeCallback = Arc<dyn Fn(&Context, Ref) -> Action + Send + Sync>;

/// Outcome of a node's most recent execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// Not executed since creation.
    NotRun,
    /// Last execution succeeded.
    Ok,
    /// Last execution failed with this error.
    Failed(VxError),
}

pub(crate) struct NodeObj {
    pub graph: Ref,
    pub kernel: Ref,
    pub affinity: Ref,
    pub parameters: Vec<Option<Ref>>,
    pub status: NodeStatus,
    pub perf: Perf,
    pub callback: Option<NodeCallback>,
    pub attributes: KernelAttributes,
    pub local_data: Vec<u8>,
    pub is_replicated: bool,
    pub replicated: Vec<bool>,
    pub child: Option<Ref>,
    pub state: Option<Box<dyn Any + Send>>,
    pub executed: bool,
}

impl NodeObj {
    fn new(graph: Ref, kernel: Ref, affinity: Ref, arity: usize, attributes: KernelAttributes) -> Self {
        Self {
            graph,
            kernel,
            affinity,
            parameters: vec![None; arity],
            status: NodeStatus::NotRun,
            perf: Perf::default(),
            callback: None,
            attributes,
            local_data: Vec::new(),
            is_replicated: false,
            replicated: vec![false; arity],
            child: None,
            state: None,
            executed: false,
        }
    }
}

impl fmt::Debug for NodeObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeObj")
            .field("graph", &self.graph)
            .field("kernel", &self.kernel)
            .field("parameters", &self.parameters)
            .field("status", &self.status)
            .field("is_replicated", &self.is_replicated)
            .finish()
    }
}

fn keep_first(result: &mut VxResult<()>, next: VxResult<()>) {
    if let (Ok(()), Err(err)) = (&*result, next) {
        *result = Err(err);
    }
}

impl Context {
    /// Create a node running `kernel` with every parameter unbound.
    ///
    /// The host receives one handle; the graph holds one internal reference.
    pub fn create_generic_node(&mut self, graph: Ref, kernel: Ref) -> VxResult<Ref> {
        let limit = self.config().max_nodes_per_graph;
        let count = self.graph_obj(graph)?.nodes.len();
        if count >= limit {
            return Err(VxError::NoResources(format!(
                "{graph} already holds {count} nodes (limit {limit})"
            )));
        }
        let k = self.kernel_obj(kernel)?;
        let object = NodeObj::new(graph, kernel, k.target, k.signature.len(), k.attributes);
        let name = k.name.clone();
        let node = self.create_reference(RefType::Node, Counter::External, Some(graph), Object::Node(object))?;
        self.increment_reference(node, Counter::Internal)?;
        self.increment_reference(kernel, Counter::Internal)?;
        self.graph_obj_mut(graph)?.nodes.push(node);
        self.mark_mutated(graph)?;
        debug!(%graph, %node, kernel = %name, "created node");
        Ok(node)
    }

    /// Create a node and bind `params` in order; `None` entries stay unbound.
    ///
    /// Any binding failure removes the node again and returns the error.
    pub fn create_node_with_parameters(
        &mut self,
        graph: Ref,
        kernel: Ref,
        params: &[Option<Ref>],
    ) -> VxResult<Ref> {
        let arity = self.kernel_obj(kernel)?.signature.len();
        if params.len() > arity {
            return Err(VxError::BadParameter(format!(
                "{} values for a kernel with {arity} parameters",
                params.len()
            )));
        }
        let node = self.create_generic_node(graph, kernel)?;
        for (index, value) in params.iter().enumerate() {
            let Some(value) = value else { continue };
            if let Err(err) = self.set_parameter_by_index(node, index, Some(*value)) {
                self.remove_node(node)?;
                return Err(err);
            }
        }
        Ok(node)
    }

    /// Detach a node from its graph and drop the caller's handle.
    pub fn remove_node(&mut self, node: Ref) -> VxResult<()> {
        let graph = self.node_obj(node)?.graph;
        if self.reference_count(node)? == 0 {
            return Err(VxError::BadReference(format!("{node} has no host handle")));
        }
        let g = self.graph_obj_mut(graph)?;
        let position = g
            .nodes
            .iter()
            .position(|n| *n == node)
            .ok_or_else(|| VxError::Internal(format!("{node} missing from {graph}")))?;
        g.nodes.swap_remove(position);
        for parameter in g.parameters.iter_mut().filter(|p| p.node == Some(node)) {
            parameter.node = None;
        }
        self.mark_mutated(graph)?;
        debug!(%graph, %node, "removed node");
        self.release_internal(node)?;
        self.release_reference(node)
    }

    /// Drop a host handle on a node.
    pub fn release_node(&mut self, node: Ref) -> VxResult<()> {
        self.node_obj(node)?;
        self.release_reference(node)
    }

    /// Install or clear the completion callback.
    ///
    /// Replacing an installed callback with a different one is not supported; clear it first.
    pub fn set_node_callback(&mut self, node: Ref, callback: Option<NodeCallback>) -> VxResult<()> {
        let n = self.node_obj_mut(node)?;
        if let (Some(existing), Some(new)) = (&n.callback, &callback) {
            if !Arc::ptr_eq(existing, new) {
                return Err(VxError::NotSupported(format!(
                    "{node} already has a completion callback"
                )));
            }
        }
        n.callback = callback;
        Ok(())
    }

    /// Status of the most recent execution.
    pub fn node_status(&self, node: Ref) -> VxResult<NodeStatus> {
        Ok(self.node_obj(node)?.status.clone())
    }

    /// Execution timings, one sample per kernel invocation; replicas count separately.
    pub fn node_perf(&self, node: Ref) -> VxResult<Perf> {
        Ok(self.node_obj(node)?.perf)
    }

    /// Kernel implementation currently bound.
    pub fn node_kernel(&self, node: Ref) -> VxResult<Ref> {
        Ok(self.node_obj(node)?.kernel)
    }

    /// Owning graph.
    pub fn node_graph(&self, node: Ref) -> VxResult<Ref> {
        Ok(self.node_obj(node)?.graph)
    }

    /// Target the node dispatches to.
    pub fn node_target(&self, node: Ref) -> VxResult<Ref> {
        Ok(self.node_obj(node)?.affinity)
    }

    /// Number of parameter slots.
    pub fn node_parameter_count(&self, node: Ref) -> VxResult<usize> {
        Ok(self.node_obj(node)?.parameters.len())
    }

    /// Value bound at `index`, without taking a handle.
    pub fn node_parameter(&self, node: Ref, index: usize) -> VxResult<Option<Ref>> {
        let n = self.node_obj(node)?;
        n.parameters.get(index).copied().ok_or_else(|| {
            VxError::BadParameter(format!("index {index} out of range for {node}"))
        })
    }

    /// Whether the node fans out over container items.
    pub fn is_node_replicated(&self, node: Ref) -> VxResult<bool> {
        Ok(self.node_obj(node)?.is_replicated)
    }

    /// Per-parameter replication flags.
    pub fn node_replicate_flags(&self, node: Ref) -> VxResult<Vec<bool>> {
        Ok(self.node_obj(node)?.replicated.clone())
    }

    /// Border handling for this node.
    pub fn node_border_mode(&self, node: Ref) -> VxResult<BorderMode> {
        Ok(self.node_obj(node)?.attributes.border)
    }

    /// Override the kernel's default border handling.
    pub fn set_node_border_mode(&mut self, node: Ref, border: BorderMode) -> VxResult<()> {
        self.node_obj_mut(node)?.attributes.border = border;
        Ok(())
    }

    /// Scratch bytes allocated for this node at verification.
    pub fn node_local_data_size(&self, node: Ref) -> VxResult<usize> {
        Ok(self.node_obj(node)?.attributes.local_data_size)
    }

    /// Change the scratch size; takes effect at the next verification.
    pub fn set_node_local_data_size(&mut self, node: Ref, size: usize) -> VxResult<()> {
        let n = self.node_obj_mut(node)?;
        n.attributes.local_data_size = size;
        let graph = n.graph;
        self.mark_mutated(graph)
    }

    /// Mark which parameters fan out over container items.
    ///
    /// Each flagged parameter must be bound to an item of a pyramid or object array and
    /// every flagged container must hold the same number of items. Output parameters
    /// must be flagged. On any failure the node is left exactly as it was.
    pub fn replicate_node(&mut self, graph: Ref, node: Ref, flags: &[bool]) -> VxResult<()> {
        self.graph_obj(graph)?;
        let n = self.node_obj(node)?;
        if n.graph != graph {
            return Err(VxError::InvalidValue(format!("{node} does not belong to {graph}")));
        }
        let signature = self.kernel_obj(n.kernel)?.signature.clone();
        if flags.len() != signature.len() {
            return Err(VxError::BadParameter(format!(
                "{} replicate flags for {} parameters",
                flags.len(),
                signature.len()
            )));
        }
        let mut replicas: Option<usize> = None;
        for (index, (desc, flag)) in signature.iter().zip(flags).enumerate() {
            if !*flag {
                if desc.direction.writes() {
                    return Err(VxError::InvalidValue(format!(
                        "output parameter {index} of {node} must be replicated"
                    )));
                }
                continue;
            }
            let value = n.parameters.get(index).copied().flatten().ok_or_else(|| {
                VxError::BadParameter(format!("replicated parameter {index} of {node} is unbound"))
            })?;
            let count = self.replica_source(value)?.len();
            match replicas {
                None => replicas = Some(count),
                Some(expected) if expected != count => {
                    return Err(VxError::InvalidValue(format!(
                        "parameter {index} spans {count} items, expected {expected}"
                    )))
                }
                Some(_) => {}
            }
        }
        if replicas.is_none() {
            return Err(VxError::InvalidValue(format!("no parameter of {node} is flagged")));
        }
        let n = self.node_obj_mut(node)?;
        n.replicated = flags.to_vec();
        n.is_replicated = true;
        assert_invariant(
            REPLICATION_ATOMIC,
            n.replicated.len() == flags.len(),
            "replication committed after full validation",
            Some("replicate_node"),
        );
        self.mark_mutated(graph)?;
        debug!(%node, replicas = replicas.unwrap_or(0), "node replicated");
        Ok(())
    }

    /// Items of the container that `item` belongs to.
    pub(crate) fn replica_source(&self, item: Ref) -> VxResult<&[Ref]> {
        let scope = self
            .entity(item)?
            .header
            .scope
            .ok_or_else(|| VxError::InvalidValue(format!("{item} is not a container item")))?;
        let container = self.data_obj(scope).map_err(|_| {
            VxError::InvalidValue(format!("{item} is not a container item"))
        })?;
        if !container.kind().is_container() {
            return Err(VxError::InvalidValue(format!("{item} is not a container item")));
        }
        Ok(container.items())
    }

    /// Attach a nested graph executed by the node's kernel.
    ///
    /// The child's graph parameters must match the kernel signature position by
    /// position in direction, type and state. `None` detaches the current child.
    pub fn set_child_graph(&mut self, node: Ref, child: Option<Ref>) -> VxResult<()> {
        let (kernel, graph, previous) = {
            let n = self.node_obj(node)?;
            (n.kernel, n.graph, n.child)
        };
        if let Some(child) = child {
            if child == graph {
                return Err(VxError::InvalidValue(format!(
                    "{node} cannot nest its own graph"
                )));
            }
            let signature: Vec<ParamDesc> = self.kernel_obj(kernel)?.signature.clone();
            let count = self.graph_parameter_count(child)?;
            if count != signature.len() {
                return Err(VxError::InvalidValue(format!(
                    "child graph exposes {count} parameters, kernel declares {}",
                    signature.len()
                )));
            }
            for (index, desc) in signature.iter().enumerate() {
                let exposed = self.graph_parameter_desc(child, index)?;
                if exposed != *desc {
                    return Err(VxError::InvalidValue(format!(
                        "child graph parameter {index} does not match the kernel signature"
                    )));
                }
            }
            self.increment_reference(child, Counter::Internal)?;
        }
        self.node_obj_mut(node)?.child = child;
        if let Some(previous) = previous {
            self.release_internal(previous)?;
        }
        Ok(())
    }

    /// Nested graph attached to the node.
    pub fn child_graph(&self, node: Ref) -> VxResult<Option<Ref>> {
        Ok(self.node_obj(node)?.child)
    }

    /// Tear down per-node kernel state built at verification.
    pub(crate) fn deinitialize_node(&mut self, node: Ref) -> VxResult<()> {
        let n = self.node_obj_mut(node)?;
        n.local_data = Vec::new();
        let Some(state) = n.state.take() else {
            return Ok(());
        };
        let kernel = n.kernel;
        self.kernel_def(kernel)?.deinitialize(state)
    }

    pub(crate) fn destruct_node(&mut self, r: Ref, mut node: NodeObj) -> VxResult<()> {
        let mut result = Ok(());
        if let Some(state) = node.state.take() {
            match self.kernel_def(node.kernel) {
                Ok(def) => keep_first(&mut result, def.deinitialize(state)),
                Err(err) => warn!(node = %r, %err, "kernel gone before node state teardown"),
            }
        }
        for (index, value) in node.parameters.iter().enumerate() {
            let Some(value) = *value else { continue };
            let tag = self.entity(value).ok().and_then(|e| e.header.delay);
            if let Some(tag) = tag {
                keep_first(&mut result, self.unlink_delay_slot(tag, r, index));
            }
            keep_first(&mut result, self.release_internal(value));
        }
        if let Some(child) = node.child {
            keep_first(&mut result, self.release_internal(child));
        }
        keep_first(&mut result, self.release_internal(node.kernel));
        result
    }
}
