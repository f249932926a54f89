//! Bounded FIFOs and the three-stage execution queue.
//!
//! [`RingBuffer`] holds exactly `capacity` items. Its length is the distance between
//! a monotonically advancing write position and read position, so no slot is
//! sacrificed to tell a full ring from an empty one.
//!
//! [`ExecutionQueue`] chains three rings (pending, ready, done) behind one lock.
//! Moving an item between stages checks both ends first, so a move either happens
//! completely or leaves both stages untouched. Consumers can block until the done
//! stage has something to drain.

use crate::invariant_ppt::{assert_invariant, QUEUE_NO_LOSS, QUEUE_STAGE_ATOMIC};
use parking_lot::{Condvar, Mutex};
use rtrb::PushError;
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// Fixed-capacity FIFO.
pub struct RingBuffer<T> {
    producer: rtrb::Producer<T>,
    consumer: rtrb::Consumer<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Empty ring holding up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        Self {
            producer,
            consumer,
            capacity,
        }
    }

    /// Append `item`, handing it back when the ring is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if let Err(PushError::Full(item)) = self.producer.push(item) {
            return Err(item);
        }
        Ok(())
    }

    /// Remove the oldest item.
    pub fn dequeue(&mut self) -> Option<T> {
        self.consumer.pop().ok()
    }

    /// Oldest item, left in place.
    pub fn peek(&self) -> Option<&T> {
        self.consumer.peek().ok()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.consumer.slots()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    /// Whether another enqueue would fail.
    pub fn is_full(&self) -> bool {
        self.producer.is_full()
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

struct Stages<T> {
    pending: RingBuffer<T>,
    ready: RingBuffer<T>,
    done: RingBuffer<T>,
}

/// Pending, ready and done stages sharing one lock.
pub struct ExecutionQueue<T> {
    stages: Mutex<Stages<T>>,
    done_signal: Condvar,
    depth: usize,
}

impl<T> ExecutionQueue<T> {
    /// Queue whose stages each hold `depth` items.
    pub fn new(depth: usize) -> Self {
        Self {
            stages: Mutex::new(Stages {
                pending: RingBuffer::new(depth),
                ready: RingBuffer::new(depth),
                done: RingBuffer::new(depth),
            }),
            done_signal: Condvar::new(),
            depth,
        }
    }

    /// Capacity of each stage.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Add an item to the pending stage, handing it back when pending is full.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        self.stages.lock().pending.enqueue(item)
    }

    /// Add every item to the pending stage, or none of them.
    ///
    /// Hands all items back when pending lacks room for the whole batch.
    pub fn enqueue_all(&self, items: Vec<T>) -> Result<(), Vec<T>> {
        let mut stages = self.stages.lock();
        let room = stages.pending.capacity() - stages.pending.len();
        if items.len() > room {
            return Err(items);
        }
        let count = items.len();
        let lost = items
            .into_iter()
            .filter_map(|item| stages.pending.enqueue(item).err())
            .count();
        assert_invariant(
            QUEUE_NO_LOSS,
            lost == 0,
            "batch fits the pending stage",
            Some("enqueue_all"),
        );
        trace!(count, pending = stages.pending.len(), "enqueued batch");
        Ok(())
    }

    /// Move the oldest pending item to ready.
    ///
    /// Returns `false`, changing nothing, when pending is empty or ready is full.
    pub fn move_pending_to_ready(&self) -> bool {
        let mut stages = self.stages.lock();
        let Stages { pending, ready, .. } = &mut *stages;
        let moved = transfer(pending, ready);
        if moved {
            trace!(pending = pending.len(), ready = ready.len(), "moved item to ready");
        }
        moved
    }

    /// Move the oldest ready item to done and wake waiters.
    ///
    /// Returns `false`, changing nothing, when ready is empty or done is full.
    pub fn move_ready_to_done(&self) -> bool {
        let moved = {
            let mut stages = self.stages.lock();
            let Stages { ready, done, .. } = &mut *stages;
            transfer(ready, done)
        };
        if moved {
            self.done_signal.notify_all();
        }
        moved
    }

    /// Remove the oldest done item.
    pub fn dequeue_done(&self) -> Option<T> {
        self.stages.lock().done.dequeue()
    }

    /// Remove every done item, oldest first.
    pub fn drain_done(&self) -> Vec<T> {
        let mut stages = self.stages.lock();
        std::iter::from_fn(|| stages.done.dequeue()).collect()
    }

    /// Block until the done stage is non-empty or `timeout` elapses.
    ///
    /// Returns whether items are waiting.
    pub fn wait_for_done(&self, timeout: Duration) -> bool {
        let mut stages = self.stages.lock();
        self.done_signal
            .wait_while_for(&mut stages, |stages| stages.done.is_empty(), timeout);
        !stages.done.is_empty()
    }

    /// Items waiting to be staged.
    pub fn pending_len(&self) -> usize {
        self.stages.lock().pending.len()
    }

    /// Items staged for the next pass.
    pub fn ready_len(&self) -> usize {
        self.stages.lock().ready.len()
    }

    /// Items whose pass has completed.
    pub fn done_len(&self) -> usize {
        self.stages.lock().done.len()
    }
}

impl<T: Clone> ExecutionQueue<T> {
    /// Copy of the oldest ready item.
    pub fn peek_ready(&self) -> Option<T> {
        self.stages.lock().ready.peek().cloned()
    }
}

impl<T> fmt::Debug for ExecutionQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages = self.stages.lock();
        f.debug_struct("ExecutionQueue")
            .field("pending", &stages.pending.len())
            .field("ready", &stages.ready.len())
            .field("done", &stages.done.len())
            .field("depth", &self.depth)
            .finish()
    }
}

/// Move one item from `from` to `to` if both ends allow it.
fn transfer<T>(from: &mut RingBuffer<T>, to: &mut RingBuffer<T>) -> bool {
    let before = (from.len(), to.len());
    if from.is_empty() || to.is_full() {
        assert_invariant(
            QUEUE_STAGE_ATOMIC,
            (from.len(), to.len()) == before,
            "blocked move leaves both stages unchanged",
            Some("transfer"),
        );
        return false;
    }
    let total = before.0 + before.1;
    let Some(item) = from.dequeue() else {
        return false;
    };
    let stored = to.enqueue(item).is_ok();
    assert_invariant(
        QUEUE_NO_LOSS,
        stored && from.len() + to.len() == total,
        "item moved between stages without loss",
        Some("transfer"),
    );
    stored
}
