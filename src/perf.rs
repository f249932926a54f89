//! Timing records for nodes and graphs.

use std::time::{Duration, Instant};

/// Accumulated timing of repeated invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Perf {
    /// Duration of the most recent invocation.
    pub tmp: Duration,
    /// Start of the most recent invocation.
    pub beg: Option<Instant>,
    /// End of the most recent invocation.
    pub end: Option<Instant>,
    /// Sum over all invocations.
    pub sum: Duration,
    /// Mean over all invocations.
    pub avg: Duration,
    /// Shortest invocation.
    pub min: Duration,
    /// Longest invocation.
    pub max: Duration,
    /// Number of completed invocations.
    pub num: u32,
}

impl Perf {
    /// Mark the start of an invocation.
    pub fn start(&mut self) {
        self.beg = Some(Instant::now());
    }

    /// Mark the end of the invocation started by [`Perf::start`].
    pub fn stop(&mut self) {
        let Some(beg) = self.beg else {
            return;
        };
        let end = Instant::now();
        self.end = Some(end);
        self.tmp = end.duration_since(beg);
        self.sum += self.tmp;
        self.num += 1;
        self.avg = self.sum / self.num;
        if self.num == 1 || self.tmp < self.min {
            self.min = self.tmp;
        }
        if self.tmp > self.max {
            self.max = self.tmp;
        }
    }
}
