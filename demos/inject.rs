//! Feeding a pipeline from outside the graph: blobs built on the main
//! thread are injected into a named port with `send_to_port`, against a
//! small queue with the discard policy.

use std::sync::Arc;
use std::time::Duration;

use conflux::prelude::*;
use log::{info, warn};

struct Printer;

struct PrinterWorker;

impl NodeImpl for Printer {
    fn create_worker(&self) -> Box<dyn Worker> {
        Box::new(PrinterWorker)
    }
}

impl Worker for PrinterWorker {
    fn process(&mut self, ctx: &WorkerCtx) {
        for blob in ctx.get_batched_input(&[0]) {
            if let Ok(text) = blob.get::<String, ()>(0) {
                info!("frame {}: {}", blob.frame_id, *text);
            }
            // simulate a slow consumer so the injector overruns the queue
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

fn main() {
    conflux::logger::init();
    conflux::logger::set_log_level(log::LevelFilter::Info);
    conflux::logger::enable_profiling();

    let config = PipelineConfig {
        queue_capacity: 4,
        port_policy: PortPolicy::DiscardIfFull,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::with_config(config);
    pipeline
        .set_source(Node::new(1, 0, 1, Printer), "printer")
        .unwrap();
    pipeline.prepare().unwrap();
    pipeline.start().unwrap();

    let mut delivered = 0;
    let mut dropped = 0;
    for frame_id in 0..50 {
        let mut blob = Blob::with_ids(0, frame_id);
        blob.stamp_now();
        blob.emplace::<String, ()>(format!("payload #{frame_id}"), 1, None);
        match pipeline.send_to_port("printer", 0, Arc::new(blob), Duration::from_millis(5)) {
            Ok(()) => delivered += 1,
            Err(PipelineError::PortFullDiscarded) => dropped += 1,
            Err(e) => {
                warn!("injection failed: {e}");
                break;
            }
        }
        precise_sleep(Duration::from_millis(2));
    }

    // let the printer drain what was queued
    std::thread::sleep(Duration::from_millis(300));
    pipeline.stop().unwrap();
    info!("injected {delivered}, dropped {dropped}");
}
