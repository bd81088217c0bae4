//! Bounded frame queue between the driver callback and the collector thread.
//!
//! The producer side is the OS audio callback: it must never block, so frames
//! are enqueued with `try_send` and dropped outright when the queue is
//! saturated. A dropped frame is a brief gap; a stalled driver callback is an
//! audible device-level glitch, which is strictly worse.
//!
//! The consumer side is the collector thread, which polls with a short
//! timeout so it can re-check the session flags between frames.

pub mod frame;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::buffering::frame::AudioFrame;

/// Producer half — held by the driver callback.
pub type FrameProducer = Sender<AudioFrame>;

/// Consumer half — held by the collector thread.
pub type FrameConsumer = Receiver<AudioFrame>;

/// Queue capacity in frames. At 1024-sample blocks and 16 kHz this is ~4 s of
/// backlog — far more than a healthy collector ever leaves unconsumed.
pub const QUEUE_CAPACITY: usize = 64;

/// Create a matched producer/consumer pair for one capture session.
pub fn create_frame_queue(capacity: usize) -> (FrameProducer, FrameConsumer) {
    bounded(capacity)
}

/// Enqueue without blocking; returns `false` when the frame was dropped
/// because the queue is full.
pub fn push_frame(producer: &FrameProducer, frame: AudioFrame) -> bool {
    producer.try_send(frame).is_ok()
}
