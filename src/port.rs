//! In/out ports: the bounded, policy-bearing edges between nodes.
//!
//! An [`InPort`] holds one or more bounded sub-queues (one per stream shard
//! under stream batching, a single one otherwise). Producers push under a
//! per-sub-queue mutex and block or discard on a full queue depending on the
//! port's [`PortPolicy`]. An [`OutPort`] points at its successor's in-port
//! and optionally converts each blob on the way through.
//!
//! Transitioning a port to [`State::Stop`] wakes every waiter; blocked
//! pushes then return [`PipelineError::Stopped`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::blob::Blob;
use crate::error::{PipelineError, Result, State};

/// Default capacity of each in-port sub-queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What a full in-port queue does with an incoming blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortPolicy {
    /// Block the pusher until space frees up (bounded by the push timeout).
    #[default]
    BlockIfFull,
    /// Drop the blob and report [`PipelineError::PortFullDiscarded`]
    /// without waiting.
    DiscardIfFull,
}

/// Wait site shared by a node's batching algorithm and its in-ports.
///
/// Pushers signal the gate after every enqueue; the batching algorithm
/// sleeps on it while the requested ports are empty. The notify takes the
/// gate lock so it cannot slip between a batcher's queue check and its wait.
#[derive(Debug, Default)]
pub(crate) struct BatchGate {
    pub(crate) lock: Mutex<()>,
    pub(crate) cv: Condvar,
}

impl BatchGate {
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }
}

#[derive(Debug, Default)]
struct Shard {
    queue: Mutex<VecDeque<Arc<Blob>>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Receiving endpoint of an edge: bounded sub-queues plus policy and state.
#[derive(Debug)]
pub struct InPort {
    capacity: AtomicUsize,
    policy: RwLock<PortPolicy>,
    shards: RwLock<Vec<Arc<Shard>>>,
    gates: RwLock<Vec<Arc<BatchGate>>>,
    state: AtomicU8,
}

impl InPort {
    pub(crate) fn new(capacity: usize) -> InPort {
        InPort {
            capacity: AtomicUsize::new(capacity.max(1)),
            policy: RwLock::new(PortPolicy::default()),
            shards: RwLock::new(vec![Arc::new(Shard::default())]),
            gates: RwLock::new(Vec::new()),
            state: AtomicU8::new(State::Idle as u8),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn policy(&self) -> PortPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: PortPolicy) {
        *self.policy.write() = policy;
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Total number of queued blobs across all sub-queues.
    pub fn len(&self) -> usize {
        self.shards
            .read()
            .iter()
            .map(|shard| shard.queue.lock().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn shard_len(&self, shard_idx: usize) -> usize {
        self.shards.read()[shard_idx].queue.lock().len()
    }

    fn route(&self, shard_count: usize, blob: &Blob) -> usize {
        if shard_count > 1 {
            blob.stream_id.rem_euclid(shard_count as i32) as usize
        } else {
            0
        }
    }

    fn shard_for(&self, blob: &Blob) -> (Arc<Shard>, usize) {
        let shards = self.shards.read();
        let idx = self.route(shards.len(), blob);
        (shards[idx].clone(), idx)
    }

    /// Push a blob, waiting up to `timeout` for space on a full queue.
    /// A zero timeout blocks indefinitely. Under
    /// [`PortPolicy::DiscardIfFull`] a full queue fails immediately with
    /// [`PipelineError::PortFullDiscarded`] instead of waiting.
    pub fn push(&self, blob: Arc<Blob>, timeout: Duration) -> Result<()> {
        let (shard, idx) = self.shard_for(&blob);
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut queue = shard.queue.lock();
        loop {
            if self.state() == State::Stop {
                return Err(PipelineError::Stopped);
            }
            if queue.len() < self.capacity() {
                queue.push_back(blob);
                drop(queue);
                shard.not_empty.notify_one();
                self.notify_gate(idx);
                return Ok(());
            }
            match self.policy() {
                PortPolicy::DiscardIfFull => {
                    warn!("discarding blob on full in-port sub-queue {idx}");
                    return Err(PipelineError::PortFullDiscarded);
                }
                PortPolicy::BlockIfFull => match deadline {
                    None => {
                        shard.not_full.wait(&mut queue);
                    }
                    Some(deadline) => {
                        if shard.not_full.wait_until(&mut queue, deadline).timed_out()
                            && queue.len() >= self.capacity()
                        {
                            return Err(PipelineError::PortFullTimeout);
                        }
                    }
                },
            }
        }
    }

    /// Non-blocking push. A full queue fails with
    /// [`PipelineError::PortFullDiscarded`] under the discard policy and
    /// [`PipelineError::PortFullTimeout`] under the blocking one.
    pub fn try_push(&self, blob: Arc<Blob>) -> Result<()> {
        let (shard, idx) = self.shard_for(&blob);
        let mut queue = shard.queue.lock();
        if self.state() == State::Stop {
            return Err(PipelineError::Stopped);
        }
        if queue.len() >= self.capacity() {
            return match self.policy() {
                PortPolicy::DiscardIfFull => {
                    warn!("discarding blob on full in-port sub-queue {idx}");
                    Err(PipelineError::PortFullDiscarded)
                }
                PortPolicy::BlockIfFull => Err(PipelineError::PortFullTimeout),
            };
        }
        queue.push_back(blob);
        drop(queue);
        shard.not_empty.notify_one();
        self.notify_gate(idx);
        Ok(())
    }

    /// Pop the oldest blob of one sub-queue, never blocking.
    pub(crate) fn try_pop(&self, shard_idx: usize) -> Option<Arc<Blob>> {
        let shard = self.shards.read().get(shard_idx)?.clone();
        let mut queue = shard.queue.lock();
        let blob = queue.pop_front();
        drop(queue);
        if blob.is_some() {
            shard.not_full.notify_one();
        }
        blob
    }

    /// Drop every queued blob. Callable in any state.
    pub fn clear(&self) {
        let shards = self.shards.read();
        for shard in shards.iter() {
            let mut queue = shard.queue.lock();
            let dropped = queue.len();
            queue.clear();
            drop(queue);
            if dropped > 0 {
                shard.not_full.notify_all();
            }
        }
    }

    /// Move the port to `state` and wake every waiter so it re-checks.
    pub fn transit_state_to(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
        let shards = self.shards.read();
        for shard in shards.iter() {
            // hold the queue lock so the notify cannot race a waiter that
            // just checked the state
            let _queue = shard.queue.lock();
            shard.not_empty.notify_all();
            shard.not_full.notify_all();
        }
        drop(shards);
        for gate in self.gates.read().iter() {
            gate.notify_all();
        }
    }

    /// Rebuild the sub-queues with `shard_count` shards, redistributing
    /// anything queued before the call by stream id.
    pub(crate) fn reshard(&self, shard_count: usize) {
        let shard_count = shard_count.max(1);
        let mut shards = self.shards.write();
        if shards.len() == shard_count {
            return;
        }
        let pending: Vec<Arc<Blob>> = shards
            .iter()
            .flat_map(|shard| shard.queue.lock().drain(..).collect::<Vec<_>>())
            .collect();
        *shards = (0..shard_count).map(|_| Arc::new(Shard::default())).collect();
        for blob in pending {
            let idx = self.route(shard_count, &blob);
            shards[idx].queue.lock().push_back(blob);
        }
    }

    pub(crate) fn install_gates(&self, gates: Vec<Arc<BatchGate>>) {
        *self.gates.write() = gates;
    }

    fn notify_gate(&self, shard_idx: usize) {
        let gates = self.gates.read();
        if gates.is_empty() {
            return;
        }
        gates[shard_idx % gates.len()].notify_all();
    }
}

/// Converter run on each blob crossing the edge.
pub type ConvertFn = Box<dyn Fn(Arc<Blob>) -> Result<Arc<Blob>> + Send + Sync>;

/// Sending endpoint of an edge: the successor's in-port plus an optional
/// on-edge converter.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct OutPort {
    link: RwLock<Option<Arc<InPort>>>,
    #[derivative(Debug = "ignore")]
    converter: RwLock<Option<ConvertFn>>,
}

impl OutPort {
    pub(crate) fn new() -> OutPort {
        OutPort::default()
    }

    /// Bind this port to `peer`, replacing any previous link and converter.
    pub(crate) fn bind(&self, peer: Arc<InPort>, converter: Option<ConvertFn>) {
        *self.link.write() = Some(peer);
        *self.converter.write() = converter;
    }

    pub fn is_linked(&self) -> bool {
        self.link.read().is_some()
    }

    pub fn is_convert_valid(&self) -> bool {
        self.converter.read().is_some()
    }

    pub(crate) fn peer(&self) -> Option<Arc<InPort>> {
        self.link.read().clone()
    }

    /// Convert (if a converter is installed) and push to the linked
    /// in-port. Converter failures surface as send failures.
    pub fn send(&self, blob: Arc<Blob>, timeout: Duration) -> Result<()> {
        let peer = self.peer().ok_or(PipelineError::PortNotLinked)?;
        let blob = {
            let converter = self.converter.read();
            match converter.as_ref() {
                Some(convert) => convert(blob)?,
                None => blob,
            }
        };
        peer.push(blob, timeout)
    }
}
