//! Three-stage pipeline: a paced synthetic camera, a mock depth-estimation
//! stage, and a console sink. The camera node spawns one worker per video
//! stream, handing each a distinct stream id from a counter in
//! `create_worker`; the last worker to run out of frames emits an EOF
//! event, and the main thread waits for it and stops the pipeline.
//!
//! ```text
//! camera (2 workers) --> depth --> display
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conflux::prelude::*;
use log::info;

const EVENT_EOF: Event = 0x3;

const WIDTH: usize = 64;
const HEIGHT: usize = 48;

/// Grayscale frame payload.
struct Frame(Vec<u8>);

/// Per-pixel inverse depth produced by the mock estimator.
struct DepthMap {
    mean: f32,
}

struct CameraNode {
    frames: usize,
    max_fps: u32,
    /// Hands every spawned worker its own stream id.
    next_stream: AtomicUsize,
    /// Workers still producing; the last one to finish raises EOF.
    active: Arc<AtomicUsize>,
}

impl CameraNode {
    fn new(frames: usize, max_fps: u32) -> CameraNode {
        CameraNode {
            frames,
            max_fps,
            next_stream: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct CameraWorker {
    stream_id: i32,
    next: usize,
    frames: usize,
    interval: Duration,
    active: Arc<AtomicUsize>,
}

impl NodeImpl for CameraNode {
    fn create_worker(&self) -> Box<dyn Worker> {
        let stream_id = self.next_stream.fetch_add(1, Ordering::SeqCst) as i32;
        self.active.fetch_add(1, Ordering::SeqCst);
        let interval = if self.max_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.max_fps as f64)
        };
        Box::new(CameraWorker {
            stream_id,
            next: 0,
            frames: self.frames,
            interval,
            active: self.active.clone(),
        })
    }
}

impl Worker for CameraWorker {
    fn process(&mut self, ctx: &WorkerCtx) {
        if self.next >= self.frames {
            if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                info!("stream {} was the last one running, raising EOF", self.stream_id);
                let _ = ctx.emit_event(EVENT_EOF, None);
            }
            ctx.break_process_loop();
            return;
        }
        let shade = (self.next % 256) as u8;
        let mut blob = Blob::with_ids(self.stream_id, self.next as i32);
        blob.stamp_now();
        blob.emplace::<Frame, ()>(Frame(vec![shade; WIDTH * HEIGHT]), WIDTH * HEIGHT, None);
        if ctx
            .send_output(Arc::new(blob), 0, Duration::from_millis(1000))
            .is_err()
        {
            ctx.break_process_loop();
            return;
        }
        self.next += 1;
        precise_sleep(self.interval);
    }
}

struct DepthNode;

struct DepthWorker;

impl NodeImpl for DepthNode {
    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(DepthWorker)
    }
}

impl Worker for DepthWorker {
    fn init(&mut self, _ctx: &WorkerCtx) -> Result<()> {
        info!("depth stage ready");
        Ok(())
    }

    fn process(&mut self, ctx: &WorkerCtx) {
        for blob in ctx.get_batched_input(&[0]) {
            let Ok(frame) = blob.get::<Frame, ()>(0) else {
                continue;
            };
            let sum: u64 = frame.0.iter().map(|&p| p as u64).sum();
            let mean = sum as f32 / frame.0.len() as f32 / 255.0;
            let mut out = Blob::with_ids(blob.stream_id, blob.frame_id);
            out.timestamp = blob.timestamp;
            out.emplace::<DepthMap, ()>(DepthMap { mean }, 1, None);
            if ctx
                .send_output(Arc::new(out), 0, Duration::from_millis(1000))
                .is_err()
            {
                ctx.break_process_loop();
                return;
            }
        }
    }
}

struct DisplayNode;

struct DisplayWorker;

impl NodeImpl for DisplayNode {
    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(DisplayWorker)
    }
}

impl Worker for DisplayWorker {
    fn process(&mut self, ctx: &WorkerCtx) {
        for blob in ctx.get_batched_input(&[0]) {
            if let Ok(depth) = blob.get::<DepthMap, ()>(0) {
                println!(
                    "stream {} frame {:>3}: mean inverse depth {:.3}",
                    blob.stream_id, blob.frame_id, depth.mean
                );
            }
        }
    }
}

fn main() {
    conflux::logger::init();
    conflux::logger::set_log_level(log::LevelFilter::Info);

    let mut pipeline = Pipeline::new();
    pipeline.register_event(EVENT_EOF).unwrap();
    // two camera workers, one per stream, each handed its id by the node
    pipeline
        .set_source(Node::new(0, 1, 2, CameraNode::new(120, 60)), "camera")
        .unwrap();
    pipeline.add_node(Node::new(1, 1, 1, DepthNode), "depth").unwrap();
    pipeline
        .add_node(Node::new(1, 0, 1, DisplayNode), "display")
        .unwrap();
    pipeline.link_node("camera", 0, "depth", 0, None).unwrap();
    pipeline.link_node("depth", 0, "display", 0, None).unwrap();

    pipeline.prepare().unwrap();
    pipeline.start().unwrap();

    pipeline.wait_for_event(EVENT_EOF).unwrap();
    pipeline.stop().unwrap();
    info!("done");
}
