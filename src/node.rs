//! Nodes, their workers, and the traits users implement to extend them.
//!
//! A [`Node`] is the topological unit of a pipeline: it owns its ports, its
//! batching configuration and loop cadence, and spawns the [`Worker`]s that
//! do the actual work. Every worker of a node shares the node's state; a
//! worker shares nothing with its siblings.
//!
//! The framework drives each worker through a fixed sequence on its
//! executor thread:
//!
//! ```text
//! init -> first_run -> process* -> last_run -> deinit
//! ```
//!
//! Workers never invoke their own lifecycle methods; they interact with the
//! framework through the [`WorkerCtx`] handed to every call.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxBuildHasher;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::batching::BatchingConfig;
use crate::blob::Blob;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, State};
use crate::event::{Event, EventCallback, EventManager, EventPayload};
use crate::port::{BatchGate, InPort, OutPort, PortPolicy, DEFAULT_QUEUE_CAPACITY};

/// The workload of one node replica.
///
/// `process` is invoked repeatedly by the executor, spaced by the node's
/// looping interval, until the pipeline stops or the worker breaks its own
/// loop through [`WorkerCtx::break_process_loop`].
pub trait Worker: Send {
    /// Called once per worker, on the executor thread, before anything
    /// else. An error skips this worker's run loop.
    fn init(&mut self, _ctx: &WorkerCtx) -> Result<()> {
        Ok(())
    }

    /// Called exactly once, just before the first `process`.
    fn first_run(&mut self, _ctx: &WorkerCtx) {}

    /// The main workload.
    fn process(&mut self, ctx: &WorkerCtx);

    /// Called exactly once, just after the final `process`.
    fn last_run(&mut self, _ctx: &WorkerCtx) {}

    /// Called once per worker, after `last_run`, in reverse insertion
    /// order within the executor.
    fn deinit(&mut self, _ctx: &WorkerCtx) {}
}

/// Node extension point: every physical worker is the result of one
/// `create_worker` call on its node.
pub trait NodeImpl: Send + Sync {
    fn create_worker(&self) -> Box<dyn Worker>;
}

/// Plain factory closures are node implementations too.
impl<F> NodeImpl for F
where
    F: Fn() -> Box<dyn Worker> + Send + Sync,
{
    fn create_worker(&self) -> Box<dyn Worker> {
        self()
    }
}

/// Per-worker handle the framework passes to every lifecycle call.
#[derive(Clone)]
pub struct WorkerCtx {
    node: Arc<Node>,
    batch_idx: usize,
    stop: Arc<AtomicBool>,
}

impl WorkerCtx {
    pub(crate) fn new(node: Arc<Node>, batch_idx: usize) -> WorkerCtx {
        WorkerCtx {
            node,
            batch_idx,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The node this worker belongs to.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The batch index assigned to this worker's executor. Only meaningful
    /// under stream batching, where it selects the stream shard.
    pub fn batch_idx(&self) -> usize {
        self.batch_idx
    }

    /// Gather input blobs from the given in-ports using the node's
    /// batching algorithm.
    pub fn get_batched_input(&self, port_indices: &[usize]) -> Vec<Arc<Blob>> {
        self.node.get_batched_input(self.batch_idx, port_indices)
    }

    /// Send a blob through the node's `port`-th out-port.
    pub fn send_output(&self, blob: Arc<Blob>, port: usize, timeout: Duration) -> Result<()> {
        self.node.send_output(blob, port, timeout)
    }

    /// Emit a pipeline-wide event from this worker.
    pub fn emit_event(&self, event: Event, data: EventPayload) -> Result<()> {
        self.node.emit_event(event, data)
    }

    /// Ask the executor to stop calling `process` on this worker.
    pub fn break_process_loop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Topological unit of the pipeline graph.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Node {
    in_ports: Vec<Arc<InPort>>,
    out_ports: Vec<OutPort>,
    total_thread_num: usize,
    #[derivative(Debug = "ignore")]
    imp: Box<dyn NodeImpl>,
    batching: RwLock<BatchingConfig>,
    looping_interval: RwLock<Duration>,
    gates: RwLock<Vec<Arc<BatchGate>>>,
    batching_stopped: AtomicBool,
    #[derivative(Debug = "ignore")]
    last_frame: Mutex<HashMap<i32, i32, FxBuildHasher>>,
    #[derivative(Debug = "ignore")]
    pending_callbacks: Mutex<Vec<(Event, EventCallback)>>,
    #[derivative(Debug = "ignore")]
    event_manager: OnceCell<Arc<EventManager>>,
    state: AtomicU8,
    prepared: AtomicBool,
}

impl Node {
    /// Build a node with the given port counts and worker pool size.
    ///
    /// Ports may be left unconnected on sources and on nodes fed through
    /// [`Pipeline::send_to_port`](crate::Pipeline::send_to_port).
    pub fn new(
        in_port_num: usize,
        out_port_num: usize,
        total_thread_num: usize,
        imp: impl NodeImpl + 'static,
    ) -> Arc<Node> {
        let gate = Arc::new(BatchGate::default());
        let in_ports: Vec<_> = (0..in_port_num)
            .map(|_| {
                let port = Arc::new(InPort::new(DEFAULT_QUEUE_CAPACITY));
                port.install_gates(vec![gate.clone()]);
                port
            })
            .collect();
        Arc::new(Node {
            in_ports,
            out_ports: (0..out_port_num).map(|_| OutPort::new()).collect(),
            total_thread_num: total_thread_num.max(1),
            imp: Box::new(imp),
            batching: RwLock::new(BatchingConfig::default()),
            looping_interval: RwLock::new(Duration::ZERO),
            gates: RwLock::new(vec![gate]),
            batching_stopped: AtomicBool::new(false),
            last_frame: Mutex::new(HashMap::default()),
            pending_callbacks: Mutex::new(Vec::new()),
            event_manager: OnceCell::new(),
            state: AtomicU8::new(State::Idle as u8),
            prepared: AtomicBool::new(false),
        })
    }

    pub fn in_port_num(&self) -> usize {
        self.in_ports.len()
    }

    pub fn out_port_num(&self) -> usize {
        self.out_ports.len()
    }

    pub fn total_thread_num(&self) -> usize {
        self.total_thread_num
    }

    pub fn in_port(&self, index: usize) -> Option<&Arc<InPort>> {
        self.in_ports.get(index)
    }

    pub fn out_port(&self, index: usize) -> Option<&OutPort> {
        self.out_ports.get(index)
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Swap in a new batching configuration. Only valid before prepare.
    pub fn config_batch(&self, config: BatchingConfig) -> Result<()> {
        if self.prepared.load(Ordering::Acquire) {
            return Err(PipelineError::InvalidState(
                "batching config is frozen after prepare",
            ));
        }
        *self.batching.write() = config;
        Ok(())
    }

    /// Set the minimum interval between successive `process` calls; zero
    /// re-enters as soon as the prior call returns. Only valid before
    /// prepare.
    pub fn config_looping_interval(&self, interval: Duration) -> Result<()> {
        if self.prepared.load(Ordering::Acquire) {
            return Err(PipelineError::InvalidState(
                "looping interval is frozen after prepare",
            ));
        }
        *self.looping_interval.write() = interval;
        Ok(())
    }

    pub fn looping_interval(&self) -> Duration {
        *self.looping_interval.read()
    }

    pub fn batching_config(&self) -> BatchingConfig {
        self.batching.read().clone()
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batching.read().batch_size
    }

    /// Run the node's batching algorithm for `batch_idx` over the given
    /// in-ports. Returns an empty vector when batching is stopped.
    pub fn get_batched_input(&self, batch_idx: usize, port_indices: &[usize]) -> Vec<Arc<Blob>> {
        if self.batching_stopped() {
            return Vec::new();
        }
        let algo = self.batching.read().resolve_algo();
        algo(self, batch_idx, port_indices)
    }

    /// Send a blob through the `port`-th out-port.
    pub fn send_output(&self, blob: Arc<Blob>, port: usize, timeout: Duration) -> Result<()> {
        self.out_port(port)
            .ok_or(PipelineError::PortOutOfRange(port))?
            .send(blob, timeout)
    }

    /// Make every future `get_batched_input` return empty immediately and
    /// wake the batchers currently waiting.
    pub fn stop_batching(&self) {
        self.batching_stopped.store(true, Ordering::Release);
        for gate in self.gates.read().iter() {
            gate.notify_all();
        }
    }

    pub fn turn_on_batching(&self) {
        self.batching_stopped.store(false, Ordering::Release);
    }

    pub(crate) fn batching_stopped(&self) -> bool {
        self.batching_stopped.load(Ordering::Acquire)
    }

    pub fn clear_all_ports(&self) {
        for port in &self.in_ports {
            port.clear();
        }
    }

    /// Register a callback for `event`. Before the node joins a pipeline
    /// the registration is parked and replayed at prepare time; afterwards
    /// it goes straight to the pipeline's event manager.
    pub fn register_callback(&self, event: Event, callback: EventCallback) -> Result<()> {
        match self.event_manager.get() {
            Some(manager) => manager.register_callback(event, callback),
            None => {
                self.pending_callbacks.lock().push((event, callback));
                Ok(())
            }
        }
    }

    /// Emit an event through the owning pipeline's event manager.
    pub fn emit_event(&self, event: Event, data: EventPayload) -> Result<()> {
        let manager = self
            .event_manager
            .get()
            .ok_or(PipelineError::InvalidState("node is not part of a pipeline"))?;
        manager.emit_event(event, &data)
    }

    /// Move the node and all its in-ports to `state`.
    pub fn transit_state_to(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
        for port in &self.in_ports {
            port.transit_state_to(state);
        }
    }

    /// In-order admission under stream batching: frames at or below the
    /// last delivered id of their stream are rejected.
    pub(crate) fn admit_in_order(&self, blob: &Blob) -> bool {
        let mut last_frame = self.last_frame.lock();
        match last_frame.entry(blob.stream_id) {
            Entry::Occupied(mut entry) => {
                if blob.frame_id <= *entry.get() {
                    false
                } else {
                    entry.insert(blob.frame_id);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(blob.frame_id);
                true
            }
        }
    }

    pub(crate) fn batch_gate(&self, index: usize) -> Option<Arc<BatchGate>> {
        let gates = self.gates.read();
        if gates.is_empty() {
            None
        } else {
            Some(gates[index % gates.len()].clone())
        }
    }

    pub(crate) fn spawn_worker(&self) -> Box<dyn Worker> {
        self.imp.create_worker()
    }

    pub(crate) fn attach_event_manager(&self, manager: Arc<EventManager>) -> Result<()> {
        let manager = self.event_manager.get_or_init(|| manager).clone();
        for (event, callback) in self.pending_callbacks.lock().drain(..) {
            manager.register_callback(event, callback)?;
        }
        Ok(())
    }

    /// Freeze the configuration and lay out gates and port shards for the
    /// configured batching policy. Called by the pipeline at prepare time.
    pub(crate) fn finalize(&self, config: &PipelineConfig) {
        let shard_count = self.batching.read().shard_count();
        let gates: Vec<_> = (0..shard_count)
            .map(|_| Arc::new(BatchGate::default()))
            .collect();
        for port in &self.in_ports {
            if port.capacity() == DEFAULT_QUEUE_CAPACITY {
                port.set_capacity(config.queue_capacity);
            }
            if port.policy() == PortPolicy::default() {
                port.set_policy(config.port_policy);
            }
            port.reshard(shard_count);
            port.install_gates(gates.clone());
        }
        *self.gates.write() = gates;
        self.prepared.store(true, Ordering::Release);
    }
}
