//! Data-flow topology: producer/consumer edges, heads, ordering and readiness.

use crate::reference::Ref;

/// Values a node reads and writes, in slot order.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeIo {
    pub inputs: Vec<Ref>,
    pub outputs: Vec<Ref>,
}

/// Topology snapshot taken at verification; indices refer to the graph's node list.
#[derive(Debug, Clone, Default)]
pub(crate) struct Topology {
    pub heads: Vec<usize>,
    pub order: Vec<usize>,
    pub preds: Vec<Vec<usize>>,
    pub succs: Vec<Vec<usize>>,
}

/// Errors while building the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TopologyError {
    NoHeads,
    Cycle(Vec<usize>),
}

impl Topology {
    /// Connect producer `i` to consumer `j` when some output of `i` feeds some input of `j`.
    pub fn build(io: &[NodeIo], feeds: impl Fn(Ref, Ref) -> bool) -> Result<Self, TopologyError> {
        let count = io.len();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (i, producer) in io.iter().enumerate() {
            for (j, consumer) in io.iter().enumerate() {
                if i == j {
                    continue;
                }
                let linked = producer
                    .outputs
                    .iter()
                    .any(|out| consumer.inputs.iter().any(|input| feeds(*out, *input)));
                if linked {
                    succs[i].push(j);
                    preds[j].push(i);
                }
            }
        }
        let heads: Vec<usize> = (0..count).filter(|i| preds[*i].is_empty()).collect();
        if heads.is_empty() && count > 0 {
            return Err(TopologyError::NoHeads);
        }
        let order = topo_sort(&preds, &succs)?;
        Ok(Self {
            heads,
            order,
            preds,
            succs,
        })
    }

    /// Nodes eligible after `last` ran.
    ///
    /// Candidates are the successors of `last` plus anything deferred in `left`; a
    /// candidate is eligible once every producer of its inputs has executed, otherwise
    /// it is deferred again.
    pub fn next_nodes(&self, last: &[usize], left: &mut Vec<usize>, executed: &[bool]) -> Vec<usize> {
        let mut candidates: Vec<usize> = Vec::new();
        for succ in last.iter().flat_map(|i| self.succs[*i].iter().copied()) {
            if !candidates.contains(&succ) {
                candidates.push(succ);
            }
        }
        for deferred in left.drain(..) {
            if !candidates.contains(&deferred) {
                candidates.push(deferred);
            }
        }
        let mut next = Vec::new();
        for candidate in candidates {
            if executed[candidate] {
                continue;
            }
            if self.preds[candidate].iter().all(|p| executed[*p]) {
                next.push(candidate);
            } else {
                left.push(candidate);
            }
        }
        next
    }
}

/// Kahn ordering; nodes left over sit on or behind a cycle.
fn topo_sort(preds: &[Vec<usize>], succs: &[Vec<usize>]) -> Result<Vec<usize>, TopologyError> {
    let mut in_degree: Vec<usize> = preds.iter().map(Vec::len).collect();
    let mut queue: std::collections::VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(preds.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &succs[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if order.len() == preds.len() {
        Ok(order)
    } else {
        let stuck = (0..preds.len()).filter(|i| !order.contains(i)).collect();
        Err(TopologyError::Cycle(stuck))
    }
}
