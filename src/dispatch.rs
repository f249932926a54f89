//! Node dispatch: runs kernels for the nodes a target is handed.

#![forbid(unsafe_code)]

use crate::context::Context;
use crate::error::{VxError, VxResult};
use crate::invariant_ppt::{assert_invariant, REPLICA_ORDER};
use crate::kernel::{ExecContext, KernelDefDyn};
use crate::node::{NodeCallback, NodeStatus};
use crate::reference::Ref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// What the graph pass does after a node completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep executing.
    Continue,
    /// Stop the pass; remaining nodes do not run.
    Abandon,
}

impl Context {
    /// Execute `count` nodes of `nodes` starting at `start`, stopping at the first abandon.
    ///
    /// This is the standard processing routine; targets without special hardware
    /// delegate to it from [`crate::target::Target::process`].
    pub fn process_nodes(&mut self, nodes: &[Ref], start: usize, count: usize) -> Action {
        let end = start.saturating_add(count).min(nodes.len());
        for &node in nodes.get(start..end).unwrap_or(&[]) {
            if self.execute_node(node) == Action::Abandon {
                return Action::Abandon;
            }
        }
        Action::Continue
    }

    /// Hand one node to its target with virtual parameters opened for the duration.
    pub(crate) fn dispatch_node(&mut self, node: Ref) -> Action {
        let (affinity, params) = match self.node_obj(node) {
            Ok(n) => (n.affinity, n.parameters.clone()),
            Err(err) => {
                error!(%node, %err, "dispatch of unknown node");
                return Action::Abandon;
            }
        };
        let backend = match self.target_obj(affinity) {
            Ok(target) => target.backend.clone(),
            Err(err) => {
                self.record_status(node, Err(err));
                return Action::Abandon;
            }
        };
        self.set_accessible(&params, true);
        let action = backend.process(self, &[node], 0, 1);
        self.set_accessible(&params, false);
        action
    }

    fn set_accessible(&mut self, params: &[Option<Ref>], accessible: bool) {
        for value in params.iter().flatten() {
            if let Ok(entity) = self.entity_mut(*value) {
                if entity.header.is_virtual {
                    entity.header.accessible = accessible;
                }
            }
        }
    }

    fn execute_node(&mut self, node: Ref) -> Action {
        let result = self.invoke_node(node);
        let failed = result.is_err();
        let callback = self.record_status(node, result);
        if failed {
            return Action::Abandon;
        }
        match callback {
            Some(callback) => {
                let action = callback(self, node);
                if action == Action::Abandon {
                    debug!(%node, "completion callback abandoned the pass");
                }
                action
            }
            None => Action::Continue,
        }
    }

    /// Store the outcome on the node and return its callback.
    fn record_status(&mut self, node: Ref, result: VxResult<()>) -> Option<NodeCallback> {
        let n = match self.node_obj_mut(node) {
            Ok(n) => n,
            Err(err) => {
                error!(%node, %err, "node vanished during execution");
                return None;
            }
        };
        n.executed = true;
        match result {
            Ok(()) => {
                n.status = NodeStatus::Ok;
                n.callback.clone()
            }
            Err(err) => {
                warn!(%node, %err, "node failed");
                n.status = NodeStatus::Failed(err);
                None
            }
        }
    }

    fn invoke_node(&mut self, node: Ref) -> VxResult<()> {
        let (kernel, params, replicated) = {
            let n = self.node_obj(node)?;
            let replicated = n.is_replicated.then(|| n.replicated.clone());
            (n.kernel, n.parameters.clone(), replicated)
        };
        let def = self.kernel_def(kernel)?;
        let mut held = self.hold(node)?;
        let result = match replicated {
            None => held.invoke_kernel(&def, node, &params),
            Some(flags) => held.invoke_replicas(&def, node, &params, &flags),
        };
        drop(held);
        result
    }

    /// Run the kernel once per replica, substituting item `i` of every flagged
    /// container, in item order.
    ///
    /// Each replica is a separate invocation in the node's timing record. The first
    /// failing replica stops the rest.
    fn invoke_replicas(
        &mut self,
        def: &Arc<dyn KernelDefDyn>,
        node: Ref,
        params: &[Option<Ref>],
        flags: &[bool],
    ) -> VxResult<()> {
        let mut sources: Vec<Option<Vec<Ref>>> = Vec::with_capacity(params.len());
        for (index, (value, flag)) in params.iter().zip(flags).enumerate() {
            if !*flag {
                sources.push(None);
                continue;
            }
            let value = value.ok_or_else(|| {
                VxError::BadParameter(format!("replicated parameter {index} of {node} is unbound"))
            })?;
            sources.push(Some(self.replica_source(value)?.to_vec()));
        }
        let replicas = sources.iter().flatten().map(Vec::len).min().unwrap_or(0);
        let mut instance = params.to_vec();
        let mut ran = Vec::with_capacity(replicas);
        let mut result = Ok(());
        for replica in 0..replicas {
            for (slot, items) in instance.iter_mut().zip(&sources) {
                if let Some(items) = items {
                    *slot = Some(items[replica]);
                }
            }
            trace!(%node, replica, "running replica");
            ran.push(replica);
            if let Err(err) = self.invoke_kernel(def, node, &instance) {
                result = Err(err);
                break;
            }
        }
        assert_invariant(
            REPLICA_ORDER,
            ran.iter().copied().eq(0..ran.len()) && (result.is_err() || ran.len() == replicas),
            "replicas ran in item order",
            Some("invoke_replicas"),
        );
        result
    }

    fn invoke_kernel(
        &mut self,
        def: &Arc<dyn KernelDefDyn>,
        node: Ref,
        params: &[Option<Ref>],
    ) -> VxResult<()> {
        let perf_enabled = self.config().perf_enabled;
        let n = self.node_obj_mut(node)?;
        let mut state = n.state.take().ok_or_else(|| {
            VxError::Internal(format!("{node} has no kernel state; graph not verified"))
        })?;
        if perf_enabled {
            n.perf.start();
        }
        let mut exec = ExecContext::new(self, node);
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| def.process(&mut exec, &mut *state, params)));
        drop(exec);
        if let Ok(n) = self.node_obj_mut(node) {
            n.state = Some(state);
            if perf_enabled {
                n.perf.stop();
            }
        }
        match outcome {
            Ok(result) => result,
            Err(_) => {
                error!(%node, kernel = def.name(), "kernel panicked");
                Err(VxError::Internal(format!("kernel {} panicked", def.name())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::data::{ScalarType, ScalarValue};
    use crate::kernel::{FnKernel, KernelId, ParamDesc, ParamType};
    use crate::target::CpuTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_with(name: &str, kernel: FnKernel) -> (Context, Ref) {
        let mut ctx = Context::new(ContextConfig::default());
        ctx.load_target(Arc::new(CpuTarget::new("cpu").with_kernel(kernel)))
            .unwrap();
        let k = ctx.get_kernel_by_name(name).unwrap();
        (ctx, k)
    }

    fn sig() -> Vec<ParamDesc> {
        vec![ParamDesc::bidirectional(ParamType::Scalar(ScalarType::U32))]
    }

    #[test]
    fn panicking_kernel_becomes_internal_error() {
        let (mut ctx, kernel) = ctx_with("test.panic", FnKernel::new(KernelId(1), "test.panic", sig(), |_, _| {
            panic!("boom")
        }));
        let graph = ctx.create_graph().unwrap();
        let s = ctx.create_scalar(ScalarValue::U32(0)).unwrap();
        let node = ctx
            .create_node_with_parameters(graph, kernel, &[Some(s)])
            .unwrap();
        let err = ctx.process_graph(graph).unwrap_err();
        assert!(matches!(err, VxError::Internal(_)));
        assert!(matches!(ctx.node_status(node).unwrap(), NodeStatus::Failed(_)));
        assert_eq!(ctx.internal_count(node).unwrap(), 1);
    }

    #[test]
    fn callback_sees_completed_node_and_can_abandon() {
        let (mut ctx, kernel) = ctx_with("test.inc", FnKernel::new(KernelId(2), "test.inc", sig(), |ctx, params| {
            let value = params[0].ok_or_else(|| VxError::BadParameter("unbound".into()))?;
            let ScalarValue::U32(n) = ctx.read_scalar(value)? else {
                return Err(VxError::invalid_type("u32", "other"));
            };
            ctx.write_scalar(value, ScalarValue::U32(n + 1))
        }));
        let graph = ctx.create_graph().unwrap();
        let s = ctx.create_scalar(ScalarValue::U32(0)).unwrap();
        let node = ctx
            .create_node_with_parameters(graph, kernel, &[Some(s)])
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callback: NodeCallback = Arc::new(move |ctx: &Context, node: Ref| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.node_status(node).unwrap(), NodeStatus::Ok);
            Action::Abandon
        });
        ctx.set_node_callback(node, Some(callback)).unwrap();
        assert_eq!(ctx.process_graph(graph), Err(VxError::GraphAbandoned));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.read_scalar(s).unwrap(), ScalarValue::U32(1));
    }

    #[test]
    fn process_nodes_clamps_range() {
        let (mut ctx, _) = ctx_with("test.noop", FnKernel::new(KernelId(3), "test.noop", vec![], |_, _| Ok(())));
        assert_eq!(ctx.process_nodes(&[], 3, 10), Action::Continue);
    }
}
