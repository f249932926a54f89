//! Builder API for graphs.

use crate::context::Context;
use crate::error::{VxError, VxResult};
use crate::reference::Ref;
use std::collections::HashMap;
use tracing::warn;

/// Builds a graph node by node, tracking the host handles it creates.
///
/// [`GraphBuilder::build`] verifies the graph, drops the node handles and returns
/// the graph handle. A builder dropped without building releases everything it made.
pub struct GraphBuilder<'a> {
    ctx: &'a mut Context,
    graph: Ref,
    nodes: Vec<Ref>,
    node_names: HashMap<String, Ref>,
    built: bool,
}

impl<'a> GraphBuilder<'a> {
    /// Start a new graph in `ctx`.
    pub fn new(ctx: &'a mut Context) -> VxResult<Self> {
        let graph = ctx.create_graph()?;
        Ok(Self {
            ctx,
            graph,
            nodes: Vec::new(),
            node_names: HashMap::new(),
            built: false,
        })
    }

    /// Graph under construction.
    pub fn graph(&self) -> Ref {
        self.graph
    }

    /// Context, for creating data objects while building.
    pub fn context(&mut self) -> &mut Context {
        self.ctx
    }

    /// Add a node running the kernel called `kernel`.
    pub fn node(&mut self, kernel: &str, params: &[Option<Ref>]) -> VxResult<Ref> {
        let k = self.ctx.get_kernel_by_name(kernel)?;
        let node = self.ctx.create_node_with_parameters(self.graph, k, params);
        self.ctx.release_kernel(k)?;
        let node = node?;
        self.nodes.push(node);
        Ok(node)
    }

    /// Add a node reachable later through [`GraphBuilder::lookup`].
    pub fn node_named(&mut self, name: &str, kernel: &str, params: &[Option<Ref>]) -> VxResult<Ref> {
        if self.node_names.contains_key(name) {
            return Err(VxError::InvalidValue(format!("node name {name} already used")));
        }
        let node = self.node(kernel, params)?;
        self.ctx.set_reference_name(node, name)?;
        self.node_names.insert(name.to_string(), node);
        Ok(node)
    }

    /// Node added under `name`.
    pub fn lookup(&self, name: &str) -> VxResult<Ref> {
        self.node_names
            .get(name)
            .copied()
            .ok_or_else(|| VxError::InvalidValue(format!("no node named {name}")))
    }

    /// Expose parameter `index` of the node called `name` as the next graph parameter.
    pub fn expose(&mut self, name: &str, index: usize) -> VxResult<usize> {
        let node = self.lookup(name)?;
        let param = self.ctx.get_parameter_by_index(node, index)?;
        let exposed = self.ctx.add_parameter_to_graph(self.graph, Some(param));
        self.ctx.release_parameter(param)?;
        exposed
    }

    /// Verify the graph and hand it over.
    pub fn build(mut self) -> VxResult<Ref> {
        self.ctx.verify_graph(self.graph)?;
        for node in std::mem::take(&mut self.nodes) {
            self.ctx.release_node(node)?;
        }
        self.built = true;
        Ok(self.graph)
    }
}

impl Drop for GraphBuilder<'_> {
    fn drop(&mut self) {
        for node in std::mem::take(&mut self.nodes) {
            if let Err(err) = self.ctx.release_node(node) {
                warn!(%node, %err, "failed to release builder node");
            }
        }
        if !self.built {
            if let Err(err) = self.ctx.release_graph(self.graph) {
                warn!(graph = %self.graph, %err, "failed to release unbuilt graph");
            }
        }
    }
}
