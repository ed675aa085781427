//! Pipeline assembly and lifecycle: add nodes, link them, prepare, start,
//! stop.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use conflux::{Blob, Node, Pipeline, Worker, WorkerCtx};
//! struct Counter;
//! impl Worker for Counter {
//!     fn process(&mut self, ctx: &WorkerCtx) {
//!         for blob in ctx.get_batched_input(&[0]) {
//!             println!("frame {}", blob.frame_id);
//!         }
//!     }
//! }
//!
//! let mut pipeline = Pipeline::new();
//! let sink = Node::new(1, 0, 1, || Box::new(Counter) as Box<dyn Worker>);
//! // fed from outside the graph, so its in-port skips upstream validation
//! pipeline.set_source(sink, "sink").unwrap();
//! pipeline.prepare().unwrap();
//! pipeline.start().unwrap();
//! pipeline
//!     .send_to_port("sink", 0, Arc::new(Blob::with_ids(0, 0)), Duration::ZERO)
//!     .unwrap();
//! pipeline.stop().unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::batching::BatchingPolicy;
use crate::blob::Blob;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, State};
use crate::event::{Event, EventCallback, EventManager, EventPayload};
use crate::executor::Executor;
use crate::logger;
use crate::node::Node;
use crate::port::ConvertFn;

struct NodeEntry {
    node: Arc<Node>,
    is_source: bool,
}

#[derive(Debug, Clone)]
struct Link {
    from: String,
    out_idx: usize,
    to: String,
    in_idx: usize,
}

/// A graph of nodes plus the machinery to run it: executors, an event
/// manager, and the shared defaults.
///
/// The graph is frozen by [`Pipeline::prepare`]; [`Pipeline::start`] spawns
/// one thread per executor and [`Pipeline::stop`] cooperatively winds
/// everything down, running every worker's shutdown phase before joining.
pub struct Pipeline {
    nodes: IndexMap<String, NodeEntry>,
    links: Vec<Link>,
    executors: Vec<Executor>,
    event_manager: Arc<EventManager>,
    config: PipelineConfig,
    state: State,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Self::with_config(PipelineConfig::default())
    }

    /// Build a pipeline with explicit defaults. A log level differing from
    /// the built-in default is applied to the global logger right away.
    pub fn with_config(config: PipelineConfig) -> Pipeline {
        if config.log_level != PipelineConfig::default().log_level {
            if let Ok(level) = config.log_level_filter() {
                logger::set_log_level(level);
            }
        }
        Pipeline {
            nodes: IndexMap::new(),
            links: Vec::new(),
            executors: Vec::new(),
            event_manager: Arc::new(EventManager::new()),
            config,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name).map(|entry| &entry.node)
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    /// Register a source node: its in-ports (if any) are fed from outside
    /// the graph and skip upstream validation.
    pub fn set_source(&mut self, node: Arc<Node>, name: impl Into<String>) -> Result<Arc<Node>> {
        self.insert(node, name.into(), true)
    }

    /// Register an interior node. Every one of its in-ports must be linked
    /// before [`Pipeline::prepare`].
    pub fn add_node(&mut self, node: Arc<Node>, name: impl Into<String>) -> Result<Arc<Node>> {
        self.insert(node, name.into(), false)
    }

    fn insert(&mut self, node: Arc<Node>, name: String, is_source: bool) -> Result<Arc<Node>> {
        if self.state != State::Idle {
            return Err(PipelineError::InvalidState(
                "nodes cannot be added after prepare",
            ));
        }
        if self.nodes.contains_key(&name) {
            return Err(PipelineError::DuplicateNode(name));
        }
        self.nodes.insert(
            name,
            NodeEntry {
                node: node.clone(),
                is_source,
            },
        );
        Ok(node)
    }

    /// Bind out-port `prev_out` of `prev` to in-port `curr_in` of `curr`,
    /// optionally converting each blob on the edge. A second link on the
    /// same out-port replaces the first.
    pub fn link_node(
        &mut self,
        prev: &str,
        prev_out: usize,
        curr: &str,
        curr_in: usize,
        converter: Option<ConvertFn>,
    ) -> Result<()> {
        if self.state != State::Idle {
            return Err(PipelineError::InvalidState("links are frozen after prepare"));
        }
        let prev_node = self
            .node(prev)
            .ok_or_else(|| PipelineError::NodeNotFound(prev.to_owned()))?
            .clone();
        let curr_node = self
            .node(curr)
            .ok_or_else(|| PipelineError::NodeNotFound(curr.to_owned()))?
            .clone();
        let out_port = prev_node
            .out_port(prev_out)
            .ok_or(PipelineError::PortOutOfRange(prev_out))?;
        let in_port = curr_node
            .in_port(curr_in)
            .ok_or(PipelineError::PortOutOfRange(curr_in))?
            .clone();
        out_port.bind(in_port, converter);
        self.links
            .retain(|link| !(link.from == prev && link.out_idx == prev_out));
        self.links.push(Link {
            from: prev.to_owned(),
            out_idx: prev_out,
            to: curr.to_owned(),
            in_idx: curr_in,
        });
        Ok(())
    }

    /// Validate the topology, distribute the event manager, materialize
    /// workers and partition them into executors.
    ///
    /// Under the default batching policy each worker gets its own executor;
    /// a stream-batched node fans out into `stream_num *
    /// thread_num_per_batch` executors, each bound to one batch index.
    /// Errors leave the pipeline idle.
    pub fn prepare(&mut self) -> Result<()> {
        if self.state != State::Idle {
            return Err(PipelineError::InvalidState("pipeline is already prepared"));
        }

        for (name, entry) in &self.nodes {
            if entry.is_source {
                continue;
            }
            for port in 0..entry.node.in_port_num() {
                let upstream = self
                    .links
                    .iter()
                    .filter(|link| link.to == *name && link.in_idx == port)
                    .count();
                match upstream {
                    0 => {
                        return Err(PipelineError::UnboundInPort {
                            node: name.clone(),
                            port,
                        })
                    }
                    1 => {}
                    _ => {
                        return Err(PipelineError::AmbiguousInPort {
                            node: name.clone(),
                            port,
                        })
                    }
                }
            }
        }

        for (name, entry) in &self.nodes {
            let batching = entry.node.batching_config();
            if batching.policy == BatchingPolicy::WithStream {
                let expected = batching.stream_num.max(1) * batching.thread_num_per_batch.max(1);
                if entry.node.total_thread_num() != expected {
                    return Err(PipelineError::WorkerPoolMismatch {
                        node: name.clone(),
                        expected,
                        actual: entry.node.total_thread_num(),
                    });
                }
            }
        }

        for entry in self.nodes.values() {
            entry.node.attach_event_manager(self.event_manager.clone())?;
        }

        let link_pairs: Vec<(String, String)> = self
            .links
            .iter()
            .map(|link| (link.from.clone(), link.to.clone()))
            .collect();

        let mut next_id = 0;
        for (name, entry) in &self.nodes {
            entry.node.finalize(&self.config);
            let batching = entry.node.batching_config();
            match batching.policy {
                BatchingPolicy::WithStream => {
                    let duplicates = batching.thread_num_per_batch.max(1);
                    for batch_idx in 0..batching.stream_num.max(1) {
                        for _ in 0..duplicates {
                            let mut executor = Executor::new(next_id, batch_idx, duplicates);
                            next_id += 1;
                            executor.add_worker(
                                name.clone(),
                                entry.node.clone(),
                                entry.node.spawn_worker(),
                            );
                            executor.generate_sorted(&link_pairs);
                            self.executors.push(executor);
                        }
                    }
                }
                _ => {
                    for _ in 0..entry.node.total_thread_num() {
                        let mut executor = Executor::new(next_id, 0, 1);
                        next_id += 1;
                        executor.add_worker(
                            name.clone(),
                            entry.node.clone(),
                            entry.node.spawn_worker(),
                        );
                        executor.generate_sorted(&link_pairs);
                        self.executors.push(executor);
                    }
                }
            }
            entry.node.transit_state_to(State::Initialized);
        }

        self.state = State::Initialized;
        info!(
            "pipeline prepared: {} nodes, {} executors",
            self.nodes.len(),
            self.executors.len()
        );
        Ok(())
    }

    /// Spawn one OS thread per executor. Non-blocking.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Initialized {
            return Err(PipelineError::InvalidState(
                "start requires a prepared pipeline",
            ));
        }
        for entry in self.nodes.values() {
            entry.node.transit_state_to(State::Running);
        }
        for executor in &mut self.executors {
            executor.start();
        }
        self.state = State::Running;
        info!("pipeline started");
        Ok(())
    }

    /// Stop the pipeline and block until every executor thread has run its
    /// shutdown phase and joined. Calling it again is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == State::Stop {
            return Ok(());
        }
        for entry in self.nodes.values() {
            entry.node.stop_batching();
            entry.node.transit_state_to(State::Stop);
        }
        for executor in &self.executors {
            executor.signal_stop();
        }
        for executor in &mut self.executors {
            executor.join();
        }
        self.state = State::Stop;
        info!("pipeline stopped");
        Ok(())
    }

    /// Inject a blob from outside the graph into a named in-port.
    pub fn send_to_port(
        &self,
        name: &str,
        port_id: usize,
        blob: Arc<Blob>,
        timeout: Duration,
    ) -> Result<()> {
        let node = self
            .node(name)
            .ok_or_else(|| PipelineError::NodeNotFound(name.to_owned()))?;
        node.in_port(port_id)
            .ok_or(PipelineError::PortOutOfRange(port_id))?
            .push(blob, timeout)
    }

    pub fn register_event(&self, event: Event) -> Result<()> {
        self.event_manager.register_event(event)
    }

    pub fn register_callback(&self, event: Event, callback: EventCallback) -> Result<()> {
        self.event_manager.register_callback(event, callback)
    }

    /// Invoke every callback of `event` synchronously on this thread and
    /// release waiters.
    pub fn emit_event(&self, event: Event, data: EventPayload) -> Result<()> {
        self.event_manager.emit_event(event, &data)
    }

    /// Block until `event` fires.
    pub fn wait_for_event(&self, event: Event) -> Result<()> {
        self.event_manager.wait_for_event(event)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
