//! Shared nodes for the integration tests: a paced frame source, a
//! collecting sink and a forwarding relay.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conflux::prelude::*;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Source emitting `frames` blobs with `frame_id = 0..frames` and
/// `stream_id = frame_id % streams`, paced by `interval`, then breaking its
/// process loop (optionally emitting an EOF event first).
pub struct FrameSource {
    frames: usize,
    interval: Duration,
    streams: i32,
    send_timeout: Duration,
    eof_event: Option<Event>,
    sent_ok: Arc<AtomicUsize>,
    discards: Arc<AtomicUsize>,
    deinits: Arc<AtomicUsize>,
}

impl FrameSource {
    pub fn new(frames: usize, interval: Duration, streams: i32) -> FrameSource {
        FrameSource {
            frames,
            interval,
            streams: streams.max(1),
            send_timeout: Duration::ZERO,
            eof_event: None,
            sent_ok: Arc::new(AtomicUsize::new(0)),
            discards: Arc::new(AtomicUsize::new(0)),
            deinits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_eof(mut self, event: Event) -> FrameSource {
        self.eof_event = Some(event);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> FrameSource {
        self.send_timeout = timeout;
        self
    }

    /// Handles to the (sent, discarded, deinit) counters, shared with every
    /// worker this source spawns.
    pub fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (
            self.sent_ok.clone(),
            self.discards.clone(),
            self.deinits.clone(),
        )
    }
}

impl NodeImpl for FrameSource {
    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(FrameSourceWorker {
            next: 0,
            frames: self.frames,
            interval: self.interval,
            streams: self.streams,
            send_timeout: self.send_timeout,
            eof_event: self.eof_event,
            sent_ok: self.sent_ok.clone(),
            discards: self.discards.clone(),
            deinits: self.deinits.clone(),
        })
    }
}

struct FrameSourceWorker {
    next: usize,
    frames: usize,
    interval: Duration,
    streams: i32,
    send_timeout: Duration,
    eof_event: Option<Event>,
    sent_ok: Arc<AtomicUsize>,
    discards: Arc<AtomicUsize>,
    deinits: Arc<AtomicUsize>,
}

impl Worker for FrameSourceWorker {
    fn process(&mut self, ctx: &WorkerCtx) {
        if self.next >= self.frames {
            if let Some(event) = self.eof_event {
                let _ = ctx.emit_event(event, None);
            }
            ctx.break_process_loop();
            return;
        }
        let frame_id = self.next as i32;
        let mut blob = Blob::with_ids(frame_id.rem_euclid(self.streams), frame_id);
        blob.stamp_now();
        blob.emplace::<u64, ()>(self.next as u64, 8, None);
        match ctx.send_output(Arc::new(blob), 0, self.send_timeout) {
            Ok(()) => {
                self.sent_ok.fetch_add(1, Ordering::SeqCst);
            }
            Err(PipelineError::PortFullDiscarded) => {
                self.discards.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {
                // stop observed
                ctx.break_process_loop();
                return;
            }
        }
        self.next += 1;
        if !self.interval.is_zero() {
            precise_sleep(self.interval);
        }
    }

    fn deinit(&mut self, _ctx: &WorkerCtx) {
        self.deinits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink draining in-port 0 and forwarding every received blob (tagged with
/// the worker's batch index) to a channel the test asserts on.
pub struct Collector {
    tx: flume::Sender<(usize, Arc<Blob>)>,
    delay: Duration,
    deinits: Arc<AtomicUsize>,
}

impl Collector {
    pub fn new(tx: flume::Sender<(usize, Arc<Blob>)>) -> Collector {
        Collector {
            tx,
            delay: Duration::ZERO,
            deinits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep this long in every `process` call, simulating a slow stage.
    pub fn with_delay(mut self, delay: Duration) -> Collector {
        self.delay = delay;
        self
    }

    pub fn deinits(&self) -> Arc<AtomicUsize> {
        self.deinits.clone()
    }
}

impl NodeImpl for Collector {
    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(CollectorWorker {
            tx: self.tx.clone(),
            delay: self.delay,
            deinits: self.deinits.clone(),
        })
    }
}

struct CollectorWorker {
    tx: flume::Sender<(usize, Arc<Blob>)>,
    delay: Duration,
    deinits: Arc<AtomicUsize>,
}

impl Worker for CollectorWorker {
    fn process(&mut self, ctx: &WorkerCtx) {
        let blobs = ctx.get_batched_input(&[0]);
        if blobs.is_empty() {
            // batching only returns empty once stopped
            ctx.break_process_loop();
            return;
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        for blob in blobs {
            let _ = self.tx.send((ctx.batch_idx(), blob));
        }
    }

    fn deinit(&mut self, _ctx: &WorkerCtx) {
        self.deinits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwards everything from in-port 0 to out-port 0 unchanged.
pub struct Relay;

impl NodeImpl for Relay {
    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(RelayWorker)
    }
}

struct RelayWorker;

impl Worker for RelayWorker {
    fn process(&mut self, ctx: &WorkerCtx) {
        let blobs = ctx.get_batched_input(&[0]);
        if blobs.is_empty() {
            ctx.break_process_loop();
            return;
        }
        for blob in blobs {
            if ctx
                .send_output(blob, 0, Duration::from_millis(1000))
                .is_err()
            {
                ctx.break_process_loop();
                return;
            }
        }
    }
}
