//! Graphs: node containers with a verify-then-execute lifecycle.
//!
//! A graph is built by adding nodes and binding data objects to their parameters.
//! Data flow is implicit: a node that writes an object feeds every node that reads
//! it. Verification checks bindings, computes the head set and topology, rejects
//! cycles and multiple writers, and initializes per-node kernel state. Execution walks
//! the snapshot breadth-first from the heads.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::config::MAX_PARAMETERS;
use crate::context::Context;
use crate::dispatch::Action;
use crate::error::{VxError, VxResult};
use crate::invariant_ppt::{
    assert_invariant, FAILURE_ABANDONS, GRAPH_REJECTS_INVALID, HEADS_COMPUTED,
    MUTATION_UNVERIFIES, VERIFY_BEFORE_EXECUTE,
};
use crate::kernel::{Direction, ParamDesc, ParamState, ValidateContext};
use crate::node::NodeStatus;
use crate::perf::Perf;
use crate::pipeline::{GraphQueue, ScheduleMode};
use crate::reference::{Counter, Object, Ref, RefType};
use crate::topology::{NodeIo, Topology, TopologyError};
use tracing::{debug, info, warn};

/// Lifecycle state of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Built or mutated since the last successful verification.
    Unverified,
    /// Ready to execute.
    Verified,
    /// A pass is in progress.
    Running,
}

/// A node parameter exposed on the graph boundary.
pub(crate) struct GraphParameter {
    pub node: Option<Ref>,
    pub index: usize,
    pub queue: Option<GraphQueue>,
}

pub(crate) struct GraphObj {
    pub nodes: Vec<Ref>,
    pub heads: Vec<Ref>,
    pub parameters: Vec<GraphParameter>,
    pub state: GraphState,
    pub reverify: bool,
    pub delays: Vec<Ref>,
    pub perf: Perf,
    pub schedule: ScheduleMode,
    pub topology: Option<Topology>,
}

impl GraphObj {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            heads: Vec::new(),
            parameters: Vec::new(),
            state: GraphState::Unverified,
            reverify: false,
            delays: Vec::new(),
            perf: Perf::default(),
            schedule: ScheduleMode::Normal,
            topology: None,
        }
    }
}

impl Context {
    /// Create an empty graph.
    pub fn create_graph(&mut self) -> VxResult<Ref> {
        let graph = self.create_reference(RefType::Graph, Counter::External, None, Object::Graph(GraphObj::new()))?;
        debug!(%graph, "created graph");
        Ok(graph)
    }

    /// Drop a host handle on a graph. Nodes without host handles go with it.
    pub fn release_graph(&mut self, graph: Ref) -> VxResult<()> {
        self.graph_obj(graph)?;
        self.release_reference(graph)
    }

    /// Force re-verification after a structural change.
    pub(crate) fn mark_mutated(&mut self, graph: Ref) -> VxResult<()> {
        let g = self.graph_obj_mut(graph)?;
        g.reverify |= g.state == GraphState::Verified;
        g.state = GraphState::Unverified;
        assert_invariant(
            MUTATION_UNVERIFIES,
            g.state == GraphState::Unverified,
            "mutated graph must be verified again",
            Some("mark_mutated"),
        );
        Ok(())
    }

    /// Current lifecycle state.
    pub fn graph_state(&self, graph: Ref) -> VxResult<GraphState> {
        Ok(self.graph_obj(graph)?.state)
    }

    /// Whether the graph can execute without re-verification.
    pub fn is_graph_verified(&self, graph: Ref) -> VxResult<bool> {
        Ok(self.graph_obj(graph)?.state == GraphState::Verified)
    }

    /// Number of nodes.
    pub fn graph_node_count(&self, graph: Ref) -> VxResult<usize> {
        Ok(self.graph_obj(graph)?.nodes.len())
    }

    /// Nodes in insertion order, with removals filled by the last node.
    pub fn graph_nodes(&self, graph: Ref) -> VxResult<&[Ref]> {
        Ok(&self.graph_obj(graph)?.nodes)
    }

    /// Heads computed at the last successful verification.
    pub fn graph_heads(&self, graph: Ref) -> VxResult<&[Ref]> {
        Ok(&self.graph_obj(graph)?.heads)
    }

    /// Timing of graph passes.
    pub fn graph_perf(&self, graph: Ref) -> VxResult<Perf> {
        Ok(self.graph_obj(graph)?.perf)
    }

    /// Expose a node parameter on the graph boundary and return its graph index.
    ///
    /// `None` reserves an empty slot. Exposing a parameter of a node in another graph
    /// is rejected.
    pub fn add_parameter_to_graph(&mut self, graph: Ref, param: Option<Ref>) -> VxResult<usize> {
        self.graph_obj(graph)?;
        let slot = match param {
            None => GraphParameter {
                node: None,
                index: 0,
                queue: None,
            },
            Some(param) => {
                let obj = self.param_obj(param)?;
                let index = obj.index;
                let node = obj.node.ok_or_else(|| {
                    VxError::InvalidValue(format!("{param} describes a kernel, not a node slot"))
                })?;
                if self.node_obj(node)?.graph != graph {
                    return Err(VxError::InvalidValue(format!(
                        "{node} does not belong to {graph}"
                    )));
                }
                GraphParameter {
                    node: Some(node),
                    index,
                    queue: None,
                }
            }
        };
        let g = self.graph_obj_mut(graph)?;
        if g.parameters.len() >= MAX_PARAMETERS {
            return Err(VxError::NoResources(format!(
                "{graph} already exposes {MAX_PARAMETERS} parameters"
            )));
        }
        g.parameters.push(slot);
        Ok(g.parameters.len() - 1)
    }

    pub(crate) fn graph_parameter_slot(&self, graph: Ref, index: usize) -> VxResult<(Ref, usize)> {
        let parameter = self.graph_obj(graph)?.parameters.get(index).ok_or_else(|| {
            VxError::BadParameter(format!("graph parameter {index} out of range for {graph}"))
        })?;
        let node = parameter.node.ok_or_else(|| {
            VxError::InvalidValue(format!("graph parameter {index} of {graph} is empty"))
        })?;
        Ok((node, parameter.index))
    }

    /// Bind a value through graph parameter `index`.
    pub fn set_graph_parameter_by_index(&mut self, graph: Ref, index: usize, value: Option<Ref>) -> VxResult<()> {
        let (node, slot) = self.graph_parameter_slot(graph, index)?;
        self.set_parameter_by_index(node, slot, value)
    }

    /// Parameter handle behind graph parameter `index`.
    pub fn get_graph_parameter_by_index(&mut self, graph: Ref, index: usize) -> VxResult<Ref> {
        let (node, slot) = self.graph_parameter_slot(graph, index)?;
        self.get_parameter_by_index(node, slot)
    }

    /// Number of exposed parameters.
    pub fn graph_parameter_count(&self, graph: Ref) -> VxResult<usize> {
        Ok(self.graph_obj(graph)?.parameters.len())
    }

    /// Declaration of the node slot behind graph parameter `index`.
    pub fn graph_parameter_desc(&self, graph: Ref, index: usize) -> VxResult<ParamDesc> {
        let (node, slot) = self.graph_parameter_slot(graph, index)?;
        let kernel = self.node_obj(node)?.kernel;
        self.kernel_obj(kernel)?
            .signature
            .get(slot)
            .copied()
            .ok_or_else(|| VxError::Internal(format!("graph parameter {index} points past {node}")))
    }

    /// Validate the graph and prepare it for execution.
    ///
    /// On failure the graph stays unverified and the error names the first problem.
    pub fn verify_graph(&mut self, graph: Ref) -> VxResult<()> {
        let result = self.verify_graph_inner(graph);
        match &result {
            Ok(()) => info!(%graph, "graph verified"),
            Err(err) => warn!(%graph, %err, "graph verification failed"),
        }
        result
    }

    fn verify_graph_inner(&mut self, graph: Ref) -> VxResult<()> {
        let (nodes, reverify) = {
            let g = self.graph_obj(graph)?;
            if g.state == GraphState::Running {
                return Err(VxError::InvalidValue(format!("{graph} is running")));
            }
            (g.nodes.clone(), g.reverify)
        };
        if reverify {
            debug!(%graph, "re-verifying after mutation");
        }
        for &node in &nodes {
            self.deinitialize_node(node)?;
        }
        {
            let g = self.graph_obj_mut(graph)?;
            g.state = GraphState::Unverified;
            g.topology = None;
            g.heads.clear();
        }

        let io = self.collect_node_io(&nodes)?;
        self.check_single_writer(&nodes, &io)?;
        let topology = Topology::build(&io, |out, input| self.check_write_dependency(out, input))
            .map_err(|err| match err {
                TopologyError::NoHeads => {
                    VxError::InvalidGraph(format!("{graph} has no head nodes"))
                }
                TopologyError::Cycle(stuck) => VxError::InvalidGraph(format!(
                    "{graph} has a cycle through {:?}",
                    stuck.iter().map(|i| nodes[*i]).collect::<Vec<_>>()
                )),
            })?;
        assert_invariant(
            GRAPH_REJECTS_INVALID,
            topology.order.len() == nodes.len(),
            "every node reachable from the heads in topological order",
            Some("verify_graph"),
        );
        assert_invariant(
            HEADS_COMPUTED,
            topology.heads.iter().all(|h| topology.preds[*h].is_empty()),
            "heads have no producers",
            Some("verify_graph"),
        );

        for &i in &topology.order {
            let node = nodes[i];
            let (kernel, params, affinity) = {
                let n = self.node_obj(node)?;
                (n.kernel, n.parameters.clone(), n.affinity)
            };
            let def = self.kernel_def(kernel)?;
            let backend = self.target_obj(affinity)?.backend.clone();
            let view = ValidateContext::new(self, node);
            def.validate(&view, &params)?;
            backend.verify(&view)?;
        }

        for &i in &topology.order {
            let node = nodes[i];
            let (kernel, params, scratch) = {
                let n = self.node_obj(node)?;
                (n.kernel, n.parameters.clone(), n.attributes.local_data_size)
            };
            let def = self.kernel_def(kernel)?;
            let state = def.initialize(&ValidateContext::new(self, node), &params)?;
            let n = self.node_obj_mut(node)?;
            n.state = Some(state);
            n.local_data = vec![0; scratch];
        }

        let g = self.graph_obj_mut(graph)?;
        g.heads = topology.heads.iter().map(|i| nodes[*i]).collect();
        g.topology = Some(topology);
        g.state = GraphState::Verified;
        g.reverify = false;
        Ok(())
    }

    /// Bound values per node, split by direction, after checking required slots and types.
    fn collect_node_io(&self, nodes: &[Ref]) -> VxResult<Vec<NodeIo>> {
        let mut io = Vec::with_capacity(nodes.len());
        for &node in nodes {
            let n = self.node_obj(node)?;
            let signature = &self.kernel_obj(n.kernel)?.signature;
            let mut entry = NodeIo::default();
            for (index, desc) in signature.iter().enumerate() {
                match n.parameters.get(index).copied().flatten() {
                    None if desc.state == ParamState::Required => {
                        return Err(VxError::BadParameter(format!(
                            "required parameter {index} of {node} is unbound"
                        )))
                    }
                    None => {}
                    Some(value) => {
                        self.check_binding(desc, value)?;
                        match desc.direction {
                            Direction::Input => entry.inputs.push(value),
                            Direction::Output | Direction::Bidirectional => {
                                entry.outputs.push(value)
                            }
                        }
                    }
                }
            }
            io.push(entry);
        }
        Ok(io)
    }

    fn check_single_writer(&self, nodes: &[Ref], io: &[NodeIo]) -> VxResult<()> {
        for (i, a) in io.iter().enumerate() {
            for (j, b) in io.iter().enumerate().skip(i + 1) {
                let clash = a.outputs.iter().find(|out| {
                    b.outputs
                        .iter()
                        .any(|other| self.check_write_dependency(**out, *other))
                });
                if let Some(object) = clash {
                    return Err(VxError::MultipleWriters(format!(
                        "{object} is written by both {} and {}",
                        nodes[i], nodes[j]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run one pass, verifying first if needed.
    ///
    /// Returns the failing node's error when a kernel fails, and
    /// [`VxError::GraphAbandoned`] when a completion callback stops the pass. Objects
    /// staged from parameter queues move to done either way.
    pub fn process_graph(&mut self, graph: Ref) -> VxResult<()> {
        if self.graph_obj(graph)?.state == GraphState::Running {
            return Err(VxError::InvalidValue(format!("{graph} is already running")));
        }
        self.stage_queued_parameters(graph)?;
        if self.graph_obj(graph)?.state == GraphState::Unverified {
            self.verify_graph(graph)?;
        }
        assert_invariant(
            VERIFY_BEFORE_EXECUTE,
            self.graph_obj(graph)?.state == GraphState::Verified,
            "graph verified before execution",
            Some("process_graph"),
        );
        let mut held = self.hold(graph)?;
        let outcome = held.run_pass(graph);
        drop(held);
        let retired = self.complete_queued_parameters(graph);
        outcome.and(retired)
    }

    fn run_pass(&mut self, graph: Ref) -> VxResult<()> {
        let perf_enabled = self.config().perf_enabled;
        let (nodes, topology) = {
            let g = self.graph_obj_mut(graph)?;
            g.state = GraphState::Running;
            if perf_enabled {
                g.perf.start();
            }
            let topology = g.topology.clone().ok_or_else(|| {
                VxError::Internal(format!("{graph} verified without a topology"))
            })?;
            (g.nodes.clone(), topology)
        };
        for &node in &nodes {
            self.node_obj_mut(node)?.executed = false;
        }
        debug!(%graph, nodes = nodes.len(), "graph pass started");

        let mut executed = vec![false; nodes.len()];
        let mut left = Vec::new();
        let mut next = topology.heads.clone();
        let mut abandoned_at: Option<usize> = None;
        'pass: while !next.is_empty() {
            for &i in &next {
                if executed[i] {
                    continue;
                }
                let action = self.dispatch_node(nodes[i]);
                executed[i] = true;
                if action == Action::Abandon {
                    abandoned_at = Some(i);
                    break 'pass;
                }
            }
            next = topology.next_nodes(&next, &mut left, &executed);
        }

        {
            let g = self.graph_obj_mut(graph)?;
            g.state = GraphState::Verified;
            if perf_enabled {
                g.perf.stop();
            }
        }

        if let Some(i) = abandoned_at {
            let node = nodes[i];
            let skipped = executed.iter().filter(|done| !**done).count();
            let quiet = nodes.iter().zip(&executed).all(|(n, dispatched)| {
                *dispatched || self.node_obj(*n).map_or(true, |o| !o.executed)
            });
            assert_invariant(
                FAILURE_ABANDONS,
                quiet,
                "no node runs after an abandon",
                Some("process_graph"),
            );
            warn!(%graph, %node, skipped, "graph pass abandoned");
            let n = self.node_obj(node)?;
            return match (&n.status, n.executed) {
                (NodeStatus::Failed(err), true) => Err(err.clone()),
                _ => Err(VxError::GraphAbandoned),
            };
        }

        let delays = self.graph_obj(graph)?.delays.clone();
        for delay in delays {
            self.age_delay(delay)?;
        }
        debug!(%graph, "graph pass completed");
        Ok(())
    }

    /// Age `delay` automatically after every successful pass of `graph`.
    pub fn register_auto_aging(&mut self, graph: Ref, delay: Ref) -> VxResult<()> {
        self.delay_obj(delay)?;
        if self.graph_obj(graph)?.delays.contains(&delay) {
            return Ok(());
        }
        self.increment_reference(delay, Counter::Internal)?;
        self.graph_obj_mut(graph)?.delays.push(delay);
        Ok(())
    }

    pub(crate) fn destruct_graph(&mut self, graph: Ref, object: GraphObj) -> VxResult<()> {
        debug!(%graph, nodes = object.nodes.len(), "destroying graph");
        let mut result = Ok(());
        for node in object.nodes.into_iter().chain(object.delays) {
            if let Err(err) = self.release_internal(node) {
                result = result.and(Err(err));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::data::{ScalarType, ScalarValue};
    use crate::kernel::{FnKernel, KernelId, ParamType};
    use crate::target::CpuTarget;
    use std::sync::Arc;

    fn add_one() -> FnKernel {
        FnKernel::new(
            KernelId(0x10),
            "test.add_one",
            vec![
                ParamDesc::input(ParamType::Scalar(ScalarType::I32)),
                ParamDesc::output(ParamType::Scalar(ScalarType::I32)),
            ],
            |ctx, params| {
                let (Some(input), Some(output)) = (params[0], params[1]) else {
                    return Err(VxError::BadParameter("unbound".to_string()));
                };
                let ScalarValue::I32(value) = ctx.read_scalar(input)? else {
                    return Err(VxError::invalid_type("i32", "other"));
                };
                ctx.write_scalar(output, ScalarValue::I32(value + 1))
            },
        )
    }

    fn setup() -> (Context, Ref) {
        let mut ctx = Context::new(ContextConfig::default());
        ctx.load_target(Arc::new(CpuTarget::new("cpu").with_kernel(add_one())))
            .unwrap();
        let kernel = ctx.get_kernel_by_name("test.add_one").unwrap();
        (ctx, kernel)
    }

    #[test]
    fn chain_runs_in_data_order() {
        let (mut ctx, kernel) = setup();
        let graph = ctx.create_graph().unwrap();
        let a = ctx.create_scalar(ScalarValue::I32(1)).unwrap();
        let b = ctx.create_virtual_scalar(graph, ScalarType::I32).unwrap();
        let c = ctx.create_scalar(ScalarValue::I32(0)).unwrap();
        // consumer added first so insertion order differs from data order
        let second = ctx
            .create_node_with_parameters(graph, kernel, &[Some(b), Some(c)])
            .unwrap();
        let first = ctx
            .create_node_with_parameters(graph, kernel, &[Some(a), Some(b)])
            .unwrap();
        ctx.verify_graph(graph).unwrap();
        assert_eq!(ctx.graph_heads(graph).unwrap(), &[first]);
        ctx.process_graph(graph).unwrap();
        assert_eq!(ctx.read_scalar(c).unwrap(), ScalarValue::I32(3));
        assert_eq!(ctx.node_status(second).unwrap(), NodeStatus::Ok);
        assert_eq!(ctx.graph_state(graph).unwrap(), GraphState::Verified);
    }

    #[test]
    fn two_writers_are_rejected() {
        let (mut ctx, kernel) = setup();
        let graph = ctx.create_graph().unwrap();
        let a = ctx.create_scalar(ScalarValue::I32(1)).unwrap();
        let out = ctx.create_scalar(ScalarValue::I32(0)).unwrap();
        ctx.create_node_with_parameters(graph, kernel, &[Some(a), Some(out)])
            .unwrap();
        ctx.create_node_with_parameters(graph, kernel, &[Some(a), Some(out)])
            .unwrap();
        assert!(matches!(
            ctx.verify_graph(graph),
            Err(VxError::MultipleWriters(_))
        ));
        assert!(!ctx.is_graph_verified(graph).unwrap());
    }

    #[test]
    fn cycle_is_invalid_graph() {
        let (mut ctx, kernel) = setup();
        let graph = ctx.create_graph().unwrap();
        let a = ctx.create_scalar(ScalarValue::I32(1)).unwrap();
        let b = ctx.create_scalar(ScalarValue::I32(0)).unwrap();
        ctx.create_node_with_parameters(graph, kernel, &[Some(a), Some(b)])
            .unwrap();
        ctx.create_node_with_parameters(graph, kernel, &[Some(b), Some(a)])
            .unwrap();
        assert!(matches!(
            ctx.verify_graph(graph),
            Err(VxError::InvalidGraph(_))
        ));
    }

    #[test]
    fn mutation_forces_reverification() {
        let (mut ctx, kernel) = setup();
        let graph = ctx.create_graph().unwrap();
        let a = ctx.create_scalar(ScalarValue::I32(1)).unwrap();
        let b = ctx.create_scalar(ScalarValue::I32(0)).unwrap();
        let node = ctx
            .create_node_with_parameters(graph, kernel, &[Some(a), Some(b)])
            .unwrap();
        ctx.verify_graph(graph).unwrap();
        let c = ctx.create_scalar(ScalarValue::I32(5)).unwrap();
        ctx.set_parameter_by_index(node, 0, Some(c)).unwrap();
        assert_eq!(ctx.graph_state(graph).unwrap(), GraphState::Unverified);
        ctx.process_graph(graph).unwrap();
        assert_eq!(ctx.read_scalar(b).unwrap(), ScalarValue::I32(6));
    }

    #[test]
    fn empty_graph_verifies() {
        let (mut ctx, _) = setup();
        let graph = ctx.create_graph().unwrap();
        ctx.verify_graph(graph).unwrap();
        ctx.process_graph(graph).unwrap();
    }

    #[test]
    fn graph_parameters_forward_to_node_slots() {
        let (mut ctx, kernel) = setup();
        let graph = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        let param = ctx.get_parameter_by_index(node, 0).unwrap();
        let index = ctx.add_parameter_to_graph(graph, Some(param)).unwrap();
        ctx.release_parameter(param).unwrap();
        assert_eq!(index, 0);
        assert_eq!(ctx.graph_parameter_count(graph).unwrap(), 1);
        let value = ctx.create_scalar(ScalarValue::I32(4)).unwrap();
        ctx.set_graph_parameter_by_index(graph, 0, Some(value)).unwrap();
        assert_eq!(ctx.node_parameter(node, 0).unwrap(), Some(value));
        assert_eq!(
            ctx.graph_parameter_desc(graph, 0).unwrap().direction,
            Direction::Input
        );
    }

    #[test]
    fn foreign_node_parameter_cannot_be_exposed() {
        let (mut ctx, kernel) = setup();
        let one = ctx.create_graph().unwrap();
        let two = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(one, kernel).unwrap();
        let param = ctx.get_parameter_by_index(node, 0).unwrap();
        assert!(matches!(
            ctx.add_parameter_to_graph(two, Some(param)),
            Err(VxError::InvalidValue(_))
        ));
    }

    #[test]
    fn releasing_graph_releases_everything() {
        let (mut ctx, kernel) = setup();
        let before = ctx.live_references();
        let graph = ctx.create_graph().unwrap();
        let a = ctx.create_scalar(ScalarValue::I32(1)).unwrap();
        let b = ctx.create_virtual_scalar(graph, ScalarType::I32).unwrap();
        let node = ctx
            .create_node_with_parameters(graph, kernel, &[Some(a), Some(b)])
            .unwrap();
        ctx.verify_graph(graph).unwrap();
        ctx.release_reference(a).unwrap();
        ctx.release_reference(b).unwrap();
        ctx.release_node(node).unwrap();
        ctx.release_graph(graph).unwrap();
        assert_eq!(ctx.live_references(), before);
    }
}
