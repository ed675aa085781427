//! Batching policies: how queued blobs are gathered for one worker call.
//!
//! A batching algorithm runs on the consumer's thread, inside
//! [`Node::get_batched_input`](crate::Node::get_batched_input). It owns the
//! locking: the built-in ones sleep on the node's per-batch gate while the
//! requested ports have nothing to hand out, and return an empty vector as
//! soon as batching is stopped.

use std::sync::Arc;

use crate::blob::Blob;
use crate::node::Node;

/// The built-in policies plus an escape hatch for user algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchingPolicy {
    /// Gather blobs regardless of their stream id. One worker pool, one
    /// shared sub-queue per in-port.
    #[default]
    IgnoringStream,
    /// Shard every in-port by `stream_id % stream_num` and bind each
    /// executor to one shard, preserving per-stream frame order.
    WithStream,
    Reserved,
}

/// A batching algorithm: `(node, batch_idx, port_indices) -> blobs`.
pub type BatchingFn = dyn Fn(&Node, usize, &[usize]) -> Vec<Arc<Blob>> + Send + Sync;

/// Per-node batching parameters, frozen at prepare time.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct BatchingConfig {
    pub policy: BatchingPolicy,
    /// Blobs gathered per requested port per call.
    pub batch_size: usize,
    /// Stream shard count under [`BatchingPolicy::WithStream`].
    pub stream_num: usize,
    /// Worker fan-out per shard under [`BatchingPolicy::WithStream`].
    pub thread_num_per_batch: usize,
    /// Custom algorithm; the policy's built-in one when `None`.
    #[derivative(Debug = "ignore")]
    pub algo: Option<Arc<BatchingFn>>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            policy: BatchingPolicy::default(),
            batch_size: 1,
            stream_num: 1,
            thread_num_per_batch: 1,
            algo: None,
        }
    }
}

impl BatchingConfig {
    /// Stream-sharded batching with `stream_num` shards and
    /// `thread_num_per_batch` workers per shard.
    pub fn with_stream(stream_num: usize, thread_num_per_batch: usize) -> BatchingConfig {
        BatchingConfig {
            policy: BatchingPolicy::WithStream,
            stream_num,
            thread_num_per_batch,
            ..BatchingConfig::default()
        }
    }

    /// Number of sub-queues each in-port splits into under this config.
    pub fn shard_count(&self) -> usize {
        match self.policy {
            BatchingPolicy::WithStream => self.stream_num.max(1),
            _ => 1,
        }
    }

    pub(crate) fn resolve_algo(&self) -> Arc<BatchingFn> {
        match &self.algo {
            Some(algo) => algo.clone(),
            None => match self.policy {
                BatchingPolicy::WithStream => Arc::new(stream_batching),
                _ => Arc::new(default_batching),
            },
        }
    }
}

/// Built-in algorithm for [`BatchingPolicy::IgnoringStream`].
///
/// Gathers `batch_size` blobs from every requested port (blocking until
/// available or stop) and returns them packed in port-index order. The
/// batch index is ignored.
pub fn default_batching(node: &Node, _batch_idx: usize, ports: &[usize]) -> Vec<Arc<Blob>> {
    gather(node, 0, ports, false)
}

/// Built-in algorithm for [`BatchingPolicy::WithStream`].
///
/// Consumes only the sub-queues whose shard index equals `batch_idx` and
/// enforces in-order delivery per stream: frames at or below the last
/// delivered id of their stream are dropped with a warning.
pub fn stream_batching(node: &Node, batch_idx: usize, ports: &[usize]) -> Vec<Arc<Blob>> {
    gather(node, batch_idx, ports, true)
}

fn gather(node: &Node, shard: usize, ports: &[usize], in_order: bool) -> Vec<Arc<Blob>> {
    let want = node.batch_size().max(1);
    let Some(gate) = node.batch_gate(shard) else {
        return Vec::new();
    };
    for &port in ports {
        let Some(in_port) = node.in_port(port) else {
            error!("batching requested out-of-range in-port {port}");
            return Vec::new();
        };
        if shard >= in_port.shard_count() {
            error!(
                "batch index {shard} exceeds the {} shards of in-port {port}",
                in_port.shard_count()
            );
            return Vec::new();
        }
    }
    let mut per_port: Vec<Vec<Arc<Blob>>> = ports.iter().map(|_| Vec::with_capacity(want)).collect();
    let mut guard = gate.lock.lock();
    loop {
        if node.batching_stopped() {
            return Vec::new();
        }
        let mut complete = true;
        for (slot, &port) in per_port.iter_mut().zip(ports) {
            let in_port = match node.in_port(port) {
                Some(in_port) => in_port,
                None => return Vec::new(),
            };
            while slot.len() < want {
                match in_port.try_pop(shard) {
                    Some(blob) => {
                        if in_order && !node.admit_in_order(&blob) {
                            warn!(
                                "dropping out-of-order frame {} of stream {}",
                                blob.frame_id, blob.stream_id
                            );
                            continue;
                        }
                        slot.push(blob);
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
        }
        if complete {
            return per_port.into_iter().flatten().collect();
        }
        gate.cv.wait(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::node::tests::idle_node;
    use std::time::Duration;

    fn frame(stream_id: i32, frame_id: i32) -> Arc<Blob> {
        Arc::new(Blob::with_ids(stream_id, frame_id))
    }

    #[test]
    fn default_batching_packs_in_port_index_order() {
        let node = idle_node(2, 0, 1);
        node.in_port(0)
            .unwrap()
            .push(frame(0, 10), Duration::ZERO)
            .unwrap();
        node.in_port(1)
            .unwrap()
            .push(frame(0, 20), Duration::ZERO)
            .unwrap();
        let batch = node.get_batched_input(0, &[0, 1]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].frame_id, 10);
        assert_eq!(batch[1].frame_id, 20);
    }

    #[test]
    fn batch_size_gathers_several_per_port() {
        let node = idle_node(1, 0, 1);
        node.config_batch(BatchingConfig {
            batch_size: 3,
            ..BatchingConfig::default()
        })
        .unwrap();
        for id in 0..3 {
            node.in_port(0).unwrap().try_push(frame(0, id)).unwrap();
        }
        let batch = node.get_batched_input(0, &[0]);
        assert_eq!(
            batch.iter().map(|b| b.frame_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn stop_releases_a_blocked_batcher() {
        let node = idle_node(1, 0, 1);
        let waiter = {
            let node = node.clone();
            std::thread::spawn(move || node.get_batched_input(0, &[0]))
        };
        std::thread::sleep(Duration::from_millis(30));
        node.stop_batching();
        assert!(waiter.join().unwrap().is_empty());
        // and every later call returns empty immediately
        assert!(node.get_batched_input(0, &[0]).is_empty());
    }

    #[test]
    fn stream_batching_consumes_only_its_shard() {
        let node = idle_node(1, 0, 2);
        node.config_batch(BatchingConfig::with_stream(2, 1)).unwrap();
        node.finalize(&PipelineConfig::default());
        let port = node.in_port(0).unwrap();
        port.try_push(frame(0, 0)).unwrap();
        port.try_push(frame(1, 0)).unwrap();
        port.try_push(frame(2, 1)).unwrap();

        let batch = node.get_batched_input(1, &[0]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].stream_id, 1);

        let batch = node.get_batched_input(0, &[0]);
        assert_eq!(batch[0].stream_id, 0);
        let batch = node.get_batched_input(0, &[0]);
        assert_eq!(batch[0].stream_id, 2);
    }

    #[test]
    fn stream_batching_drops_out_of_order_duplicates() {
        let node = idle_node(1, 0, 1);
        node.config_batch(BatchingConfig::with_stream(1, 1)).unwrap();
        node.finalize(&PipelineConfig::default());
        let port = node.in_port(0).unwrap();
        port.try_push(frame(0, 0)).unwrap();
        port.try_push(frame(0, 1)).unwrap();
        assert_eq!(node.get_batched_input(0, &[0])[0].frame_id, 0);
        assert_eq!(node.get_batched_input(0, &[0])[0].frame_id, 1);
        // a duplicate of frame 1 is skipped, frame 2 is delivered
        port.try_push(frame(0, 1)).unwrap();
        port.try_push(frame(0, 2)).unwrap();
        assert_eq!(node.get_batched_input(0, &[0])[0].frame_id, 2);
    }
}
