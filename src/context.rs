//! Engine instance: owns the reference arena and the priority-ordered target list.

use crate::config::ContextConfig;
use crate::reference::{Arena, Ref, RefType};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Top-level owner of every entity in one engine instance.
///
/// All mutation goes through `&mut Context`, which serializes structural changes to
/// graphs (node add/remove, target changes, verification) without a separate lock.
pub struct Context {
    id: u32,
    config: ContextConfig,
    pub(crate) arena: Arena,
    /// Loaded targets, highest priority first.
    pub(crate) targets: Vec<Ref>,
    pub(crate) destroyed: u64,
}

impl Context {
    /// Create an empty context. Load targets with [`Context::load_target`].
    pub fn new(config: ContextConfig) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, ?config, "creating context");
        Self {
            id,
            arena: Arena::new(id, config.max_references),
            config,
            targets: Vec::new(),
            destroyed: 0,
        }
    }

    /// Identifier embedded in every handle this context issues.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Active configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn teardown(&mut self) {
        let refs = self.arena.refs();
        let held = refs
            .iter()
            .filter(|r| self.arena.get(**r).map_or(false, |e| e.header.external > 0))
            .count();
        if held > 0 {
            debug!(context = self.id, held, "releasing context with live host handles");
        }
        for r in refs {
            let is_node = self
                .arena
                .get(r)
                .map_or(false, |e| e.header.kind == RefType::Node);
            if is_node {
                if let Err(err) = self.deinitialize_node(r) {
                    warn!(node = %r, %err, "node deinitialization failed during teardown");
                }
            }
        }
        for target in std::mem::take(&mut self.targets) {
            if let Ok(obj) = self.target_obj(target) {
                obj.backend.deinit();
            }
        }
        info!(context = self.id, "context torn down");
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("live_references", &self.arena.live())
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}
