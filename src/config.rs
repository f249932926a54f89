//! Context configuration.

use std::env;
use tracing::warn;

/// Default capacity of the reference arena.
pub const DEFAULT_MAX_REFERENCES: usize = 4096;
/// Maximum number of nodes a graph may hold.
pub const MAX_NODES: usize = 256;
/// Maximum number of parameters a kernel may declare.
pub const MAX_PARAMETERS: usize = 15;
/// Default depth of graph-parameter queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    /// Capacity of the reference arena; creating more entities fails with `NoResources`.
    pub max_references: usize,
    /// Node capacity per graph, clamped to [`MAX_NODES`].
    pub max_nodes_per_graph: usize,
    /// Default ring capacity for pipelined graph parameters.
    pub queue_depth: usize,
    /// Record per-node and per-graph timings.
    pub perf_enabled: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_references: DEFAULT_MAX_REFERENCES,
            max_nodes_per_graph: MAX_NODES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            perf_enabled: true,
        }
    }
}

impl ContextConfig {
    /// Defaults overlaid with `VXCORE_MAX_REFERENCES`, `VXCORE_QUEUE_DEPTH` and `VXCORE_PERF`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize("VXCORE_MAX_REFERENCES") {
            config.max_references = value;
        }
        if let Some(value) = read_usize("VXCORE_QUEUE_DEPTH") {
            config.queue_depth = value;
        }
        if let Ok(value) = env::var("VXCORE_PERF") {
            config.perf_enabled = !matches!(value.as_str(), "0" | "false" | "off");
        }
        config
    }

    /// Set the arena capacity.
    pub fn with_max_references(mut self, max_references: usize) -> Self {
        self.max_references = max_references;
        self
    }

    /// Set the per-graph node capacity.
    pub fn with_max_nodes_per_graph(mut self, max_nodes: usize) -> Self {
        self.max_nodes_per_graph = max_nodes.min(MAX_NODES);
        self
    }

    /// Set the default graph-parameter queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Enable or disable timing capture.
    pub fn with_perf(mut self, enabled: bool) -> Self {
        self.perf_enabled = enabled;
        self
    }
}

fn read_usize(key: &str) -> Option<usize> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}
