//! Conflux: composable multithreaded pipeline graphs.
//!
//! A pipeline is a directed graph of [`Node`]s exchanging reference-counted,
//! heterogeneously-typed payload bundles ([`Blob`]s of [`Buffer`]s) over
//! bounded port queues. Each node spawns one or more [`Worker`]s; workers
//! are grouped onto executor threads and driven through a fixed lifecycle
//! (`init`, `first_run`, repeated `process`, `last_run`, `deinit`).
//! Back-pressure is per in-port (block or discard on a full queue), stream
//! sharding and batching are per node, and cancellation is cooperative and
//! pipeline-wide.
//!
//! The building blocks:
//!
//! - [`Buffer`] / [`Blob`]: typed payload cells and the bundles that carry
//!   them across edges, with routing ids and deterministic release hooks.
//! - [`port`]: bounded FIFO sub-queues with a blocking-or-discard policy.
//! - [`batching`]: policies deciding which queued blobs feed a worker call.
//! - [`Node`] / [`Worker`] / [`NodeImpl`]: the topology unit and its
//!   replicated workload.
//! - [`Pipeline`]: graph assembly, validation, lifecycle and events.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use conflux::{Blob, Node, Pipeline, Worker, WorkerCtx};
//!
//! struct Echo;
//! impl Worker for Echo {
//!     fn process(&mut self, ctx: &WorkerCtx) {
//!         for blob in ctx.get_batched_input(&[0]) {
//!             println!("stream {} frame {}", blob.stream_id, blob.frame_id);
//!         }
//!     }
//! }
//!
//! conflux::logger::init();
//! let mut pipeline = Pipeline::new();
//! let echo = Node::new(1, 0, 1, || Box::new(Echo) as Box<dyn Worker>);
//! pipeline.set_source(echo, "echo").unwrap();
//! pipeline.prepare().unwrap();
//! pipeline.start().unwrap();
//! pipeline
//!     .send_to_port("echo", 0, Arc::new(Blob::with_ids(0, 1)), Duration::ZERO)
//!     .unwrap();
//! pipeline.stop().unwrap();
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate derivative;

pub mod batching;
pub mod blob;
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
mod executor;
pub mod logger;
pub mod node;
pub mod pipeline;
pub mod port;
pub mod sleep;

pub use batching::{BatchingConfig, BatchingPolicy};
pub use blob::Blob;
pub use buffer::{Buffer, TypedBuffer};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result, State};
pub use event::{Event, EventManager, EVENT_NULL};
pub use node::{Node, NodeImpl, Worker, WorkerCtx};
pub use pipeline::Pipeline;
pub use port::PortPolicy;

pub mod prelude {
    //! Re-exports of the types most applications need.
    pub use crate::batching::{BatchingConfig, BatchingPolicy};
    pub use crate::blob::Blob;
    pub use crate::buffer::{Buffer, TypedBuffer};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{PipelineError, Result, State};
    pub use crate::event::{Event, EventPayload, EVENT_NULL};
    pub use crate::node::{Node, NodeImpl, Worker, WorkerCtx};
    pub use crate::pipeline::Pipeline;
    pub use crate::port::PortPolicy;
    pub use crate::sleep::precise_sleep;
}
