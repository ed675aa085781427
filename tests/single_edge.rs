//! One producer, one consumer, one edge: every frame arrives, in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conflux::prelude::*;

mod common;
use common::{Collector, FrameSource};

#[test]
fn single_edge_delivers_every_frame_in_order() {
    common::init_logger();
    let (tx, rx) = flume::unbounded();

    let mut pipeline = Pipeline::new();
    let source = FrameSource::new(100, Duration::from_millis(10), 1);
    pipeline
        .set_source(Node::new(0, 1, 1, source), "reader")
        .unwrap();
    pipeline
        .add_node(Node::new(1, 0, 1, Collector::new(tx)), "sink")
        .unwrap();
    pipeline.link_node("reader", 0, "sink", 0, None).unwrap();
    pipeline.prepare().unwrap();
    pipeline.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(6);
    let mut frames = Vec::new();
    while frames.len() < 100 && Instant::now() < deadline {
        if let Ok((_, blob)) = rx.recv_timeout(Duration::from_millis(200)) {
            frames.push(blob.frame_id);
        }
    }
    pipeline.stop().unwrap();

    assert_eq!(frames, (0..100).collect::<Vec<i32>>());
}

#[test]
fn payloads_survive_the_edge() {
    common::init_logger();
    let (tx, rx) = flume::unbounded();

    let mut pipeline = Pipeline::new();
    let source = FrameSource::new(5, Duration::ZERO, 1);
    pipeline
        .set_source(Node::new(0, 1, 1, source), "reader")
        .unwrap();
    pipeline
        .add_node(Node::new(1, 0, 1, Collector::new(tx)), "sink")
        .unwrap();
    pipeline.link_node("reader", 0, "sink", 0, None).unwrap();
    pipeline.prepare().unwrap();
    pipeline.start().unwrap();

    for expected in 0..5u64 {
        let (_, blob) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let payload = blob.get::<u64, ()>(0).unwrap();
        assert_eq!(*payload, expected);
        assert!(!blob.timestamp.is_zero());
    }
    pipeline.stop().unwrap();
}
