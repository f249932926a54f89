//! Execution backends and target selection.

#![forbid(unsafe_code)]

use crate::context::Context;
use crate::dispatch::Action;
use crate::error::{VxError, VxResult};
use crate::invariant_ppt::{assert_invariant, TARGET_PRIORITY};
use crate::kernel::{KernelDef, KernelDefDyn, KernelId, ValidateContext};
use crate::reference::{Counter, Object, Ref, RefType};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Priority given to targets that do not override [`Target::priority`].
pub const DEFAULT_PRIORITY: u32 = 100;

/// An execution backend.
///
/// A target contributes kernels when it is loaded and executes ranges of nodes whose
/// affinity points at it. The default [`Target::process`] runs the standard
/// dispatcher on the calling thread.
pub trait Target: Send + Sync {
    /// Unique name, usually dot-separated (`vendor.backend`).
    fn name(&self) -> &str;

    /// Lower values are consulted first during kernel lookup.
    fn priority(&self) -> u32 {
        DEFAULT_PRIORITY
    }

    /// Kernels registered when the target is loaded.
    fn kernels(&self) -> Vec<Arc<dyn KernelDefDyn>> {
        Vec::new()
    }

    /// Per-node check run during graph verification.
    fn verify(&self, _ctx: &ValidateContext<'_>) -> VxResult<()> {
        Ok(())
    }

    /// Execute `count` nodes of `nodes` starting at `start`.
    fn process(&self, ctx: &mut Context, nodes: &[Ref], start: usize, count: usize) -> Action {
        ctx.process_nodes(nodes, start, count)
    }

    /// Called when the target is unloaded or the context is dropped.
    fn deinit(&self) {}
}

/// Host CPU backend running kernels synchronously.
pub struct CpuTarget {
    name: String,
    priority: u32,
    kernels: Vec<Arc<dyn KernelDefDyn>>,
}

impl CpuTarget {
    /// Empty backend.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: DEFAULT_PRIORITY,
            kernels: Vec::new(),
        }
    }

    /// Override the lookup priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a kernel to the catalogue.
    pub fn with_kernel<K: KernelDef>(mut self, kernel: K) -> Self {
        self.kernels.push(Arc::new(kernel));
        self
    }
}

impl fmt::Debug for CpuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuTarget")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl Target for CpuTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn kernels(&self) -> Vec<Arc<dyn KernelDefDyn>> {
        self.kernels.clone()
    }
}

/// How to choose a target for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSelect<'a> {
    /// First target, in priority order, that provides the node's kernel.
    Any,
    /// A target whose name, or one of its dot-separated components, matches.
    Named(&'a str),
}

pub(crate) struct KernelEntry {
    id: KernelId,
    name: String,
    kernel: Ref,
}

/// Target table entry.
pub(crate) struct TargetObj {
    pub backend: Arc<dyn Target>,
    pub name: String,
    pub priority: u32,
    kernels: Vec<KernelEntry>,
}

impl TargetObj {
    pub fn find_kernel_by_id(&self, id: KernelId) -> Option<Ref> {
        self.kernels.iter().find(|e| e.id == id).map(|e| e.kernel)
    }

    pub fn find_kernel_by_name(&self, name: &str) -> Option<Ref> {
        self.kernels.iter().find(|e| e.name == name).map(|e| e.kernel)
    }

    pub fn add_kernel(&mut self, id: KernelId, name: String, kernel: Ref) {
        self.kernels.push(KernelEntry { id, name, kernel });
    }

    /// Case-insensitive match on the full name or any dot-separated component.
    pub fn matches(&self, wanted: &str) -> bool {
        let wanted = wanted.to_lowercase();
        let name = self.name.to_lowercase();
        name == wanted || name.split('.').any(|part| part == wanted)
    }
}

impl Context {
    /// Load a backend and register its kernels.
    ///
    /// Targets are kept ordered by ascending priority; equal priorities keep load order.
    pub fn load_target(&mut self, backend: Arc<dyn Target>) -> VxResult<Ref> {
        let name = backend.name().to_string();
        let taken = self
            .targets
            .iter()
            .any(|t| self.target_obj(*t).map_or(false, |o| o.name.eq_ignore_ascii_case(&name)));
        if taken {
            return Err(VxError::InvalidValue(format!("target {name} already loaded")));
        }
        let priority = backend.priority();
        let kernels = backend.kernels();
        let object = TargetObj {
            backend,
            name: name.clone(),
            priority,
            kernels: Vec::new(),
        };
        let target = self.create_reference(RefType::Target, Counter::Internal, None, Object::Target(object))?;
        for kernel in kernels {
            if let Err(err) = self.register_kernel(target, kernel) {
                self.release_internal(target)?;
                return Err(err);
            }
        }
        let position = self
            .targets
            .iter()
            .position(|t| self.target_obj(*t).map_or(false, |o| o.priority > priority))
            .unwrap_or(self.targets.len());
        self.targets.insert(position, target);
        assert_invariant(
            TARGET_PRIORITY,
            self.targets.windows(2).all(|w| {
                let a = self.target_obj(w[0]).map_or(0, |o| o.priority);
                let b = self.target_obj(w[1]).map_or(0, |o| o.priority);
                a <= b
            }),
            "targets ordered by priority",
            Some("load_target"),
        );
        info!(target_name = %name, priority, "loaded target");
        Ok(target)
    }

    /// Unload a target whose kernels are no longer bound by any node or host handle.
    pub fn unload_target(&mut self, name: &str) -> VxResult<()> {
        let target = self.find_target(name)?;
        let busy = self
            .target_obj(target)?
            .kernels
            .iter()
            .any(|e| self.entity(e.kernel).map_or(false, |k| k.header.internal > 1 || k.header.external > 0));
        if busy {
            return Err(VxError::InvalidValue(format!("target {name} has kernels in use")));
        }
        self.targets.retain(|t| *t != target);
        self.target_obj(target)?.backend.deinit();
        debug!(target_name = name, "unloading target");
        self.release_internal(target)
    }

    /// Loaded targets, highest priority first.
    pub fn targets(&self) -> &[Ref] {
        &self.targets
    }

    /// Name of a loaded target.
    pub fn target_name(&self, target: Ref) -> VxResult<&str> {
        Ok(&self.target_obj(target)?.name)
    }

    pub(crate) fn find_target(&self, name: &str) -> VxResult<Ref> {
        self.targets
            .iter()
            .copied()
            .find(|t| self.target_obj(*t).map_or(false, |o| o.matches(name)))
            .ok_or_else(|| VxError::NotSupported(format!("no target named {name}")))
    }

    /// Rebind a node to a kernel implementation on another target.
    ///
    /// The node keeps its logical kernel identity; only the implementation and the
    /// affinity change. The owning graph must be verified again.
    pub fn set_node_target(&mut self, node: Ref, select: TargetSelect<'_>) -> VxResult<()> {
        let (kernel, graph) = {
            let n = self.node_obj(node)?;
            (n.kernel, n.graph)
        };
        let id = self.kernel_obj(kernel)?.id;
        let found = self
            .targets
            .iter()
            .filter_map(|t| self.target_obj(*t).ok().map(|o| (*t, o)))
            .filter(|(_, o)| match select {
                TargetSelect::Any => true,
                TargetSelect::Named(name) => o.matches(name),
            })
            .find_map(|(t, o)| o.find_kernel_by_id(id).map(|k| (t, k)));
        let (target, replacement) = found.ok_or_else(|| {
            VxError::NotSupported(format!("no matching target provides {id} for {node}"))
        })?;
        if replacement != kernel {
            if self.kernel_obj(replacement)?.signature != self.kernel_obj(kernel)?.signature {
                return Err(VxError::InvalidValue(format!(
                    "{id} on the selected target has a different signature than {node} expects"
                )));
            }
            self.deinitialize_node(node)?;
            self.increment_reference(replacement, Counter::Internal)?;
            self.node_obj_mut(node)?.kernel = replacement;
            self.release_internal(kernel)?;
        }
        self.node_obj_mut(node)?.affinity = target;
        self.mark_mutated(graph)?;
        debug!(%node, %target, "node target changed");
        Ok(())
    }

    pub(crate) fn destruct_target(&mut self, target: TargetObj) -> VxResult<()> {
        for entry in target.kernels {
            self.release_internal(entry.kernel)?;
        }
        Ok(())
    }
}
