//! Microphone capture engine.
//!
//! ## Pipeline (per session)
//!
//! ```text
//! driver callback ──copy──► NoiseConditioner (optional) ──try_send──► frame queue
//!                                                                        │
//!                                                       collector thread (recv_timeout)
//!                                                                        │
//!                                                              accumulation buffer
//!                                                                        │
//!                  stop(): drain + concatenate + gain ──► Option<AudioBuffer>
//! ```
//!
//! The driver callback runs on the OS audio thread and never blocks: a full
//! queue drops the frame, a busy conditioner lock skips conditioning, and the
//! level metric is a single atomic store. All heap-heavy work happens on the
//! collector thread or inside `stop()`.
//!
//! ## Two-phase shutdown
//!
//! `stop()` clears `recording` and then raises `shutting_down` before the
//! stream is touched, so the callback is shut out of the write path even if
//! the driver fires mid-teardown. `shutting_down` is reset at the end of
//! `stop()`, leaving a subsequent `start()` indistinguishable from the first.

pub mod backend;
pub mod denoise;
pub mod wav;

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::{create_frame_queue, frame::AudioBuffer, frame::AudioFrame, FrameConsumer},
    ipc::events::{AudioLevelEvent, CaptureEvent, CaptureStage},
};

use backend::{AudioBackend, InputStream, StreamSpec};
use denoise::NoiseConditioner;

/// Broadcast capacity for level/lifecycle events.
const BROADCAST_CAP: usize = 256;

/// How long the collector waits for a frame before re-checking session flags.
const COLLECTOR_POLL: Duration = Duration::from_millis(100);

/// Bound on waiting for the collector to exit during `stop()`.
const COLLECTOR_JOIN_LIMIT: Duration = Duration::from_secs(2);

/// Configuration for `CaptureEngine`. Owned by the orchestrator's config
/// layer; consumed here.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Capture sample rate in Hz. Default: 16000.
    pub sample_rate: u32,
    /// Interleaved channel count. Default: 1.
    pub channels: u16,
    /// Frames per driver callback. Default: 1024.
    pub block_size: u32,
    /// Input device name; `None` selects the system default.
    pub preferred_device: Option<String>,
    /// Post-capture software gain, applied at `stop()` with clipping.
    /// Default: 1.0.
    pub post_gain: f32,
    /// Captures shorter than this are discarded as "nothing to transcribe".
    /// Default: 0.5 s.
    pub min_capture_secs: f32,
    /// Suppression aggressiveness, 0 (off) to 4, handed to the
    /// `NoiseSuppressor` constructor by the embedder. The engine itself only
    /// sees the finished conditioner.
    pub noise_suppression_level: u8,
    /// Bounded frame-queue capacity. Default: `buffering::QUEUE_CAPACITY`.
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            block_size: 1024,
            preferred_device: None,
            post_gain: 1.0,
            min_capture_secs: 0.5,
            noise_suppression_level: 2,
            queue_capacity: crate::buffering::QUEUE_CAPACITY,
        }
    }
}

/// Per-session resources, guarded by the engine's session mutex.
///
/// The mutex is held only on the start/stop control path; the driver callback
/// and the collector thread never take it.
struct SessionState {
    stream: Option<Box<dyn InputStream>>,
    collector: Option<JoinHandle<()>>,
    /// Kept so `stop()` can drain frames the collector did not reach.
    queue: Option<FrameConsumer>,
    /// Accumulation buffer shared with the collector thread.
    frames: Arc<Mutex<Vec<AudioFrame>>>,
}

/// Owns the device stream and the capture pipeline for one session at a time.
///
/// At most one session is active per engine instance; `start()` while
/// recording is a no-op returning `true`.
pub struct CaptureEngine {
    config: CaptureConfig,
    backend: Arc<dyn AudioBackend>,
    /// Injected once at construction; shared with the driver callback via an
    /// uncontended `try_lock` (only the callback thread ever locks it).
    conditioner: Option<Arc<Mutex<NoiseConditioner>>>,
    session: Mutex<SessionState>,
    recording: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    /// Latest level metric, stored as f32 bits so the callback never blocks.
    level_bits: Arc<AtomicU32>,
    level_seq: Arc<AtomicU64>,
    level_tx: broadcast::Sender<AudioLevelEvent>,
    capture_tx: broadcast::Sender<CaptureEvent>,
}

impl CaptureEngine {
    /// Create an engine over the given device backend.
    ///
    /// `conditioner` is the optional real-time noise-suppression capability;
    /// pass `None` to capture raw device audio.
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: CaptureConfig,
        conditioner: Option<NoiseConditioner>,
    ) -> Self {
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (capture_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            backend,
            conditioner: conditioner.map(|c| Arc::new(Mutex::new(c))),
            session: Mutex::new(SessionState {
                stream: None,
                collector: None,
                queue: None,
                frames: Arc::new(Mutex::new(Vec::new())),
            }),
            recording: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            level_bits: Arc::new(AtomicU32::new(0)),
            level_seq: Arc::new(AtomicU64::new(0)),
            level_tx,
            capture_tx,
        }
    }

    /// Start a capture session.
    ///
    /// Returns `false` when the audio device cannot be opened — device
    /// unavailability is a recoverable condition, never a panic or an `Err`.
    /// Calling `start()` while already recording returns `true` without
    /// opening a second stream.
    pub fn start(&self) -> bool {
        let mut session = self.session.lock();

        if self.recording.load(Ordering::SeqCst) {
            debug!("start() while recording — no-op");
            return true;
        }

        // Fresh session state: queue, buffer, flags.
        self.shutting_down.store(false, Ordering::SeqCst);
        let (producer, consumer) = create_frame_queue(self.config.queue_capacity);
        let frames = Arc::new(Mutex::new(Vec::new()));

        let spec = StreamSpec {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            block_size: self.config.block_size,
        };

        let recording = Arc::clone(&self.recording);
        let shutting_down = Arc::clone(&self.shutting_down);
        let conditioner = self.conditioner.clone();
        let level_bits = Arc::clone(&self.level_bits);

        let callback = Box::new(move |data: &[f32]| {
            if shutting_down.load(Ordering::Relaxed) || !recording.load(Ordering::Relaxed) {
                return;
            }

            let samples = match &conditioner {
                Some(shared) => match shared.try_lock() {
                    // Uncontended in practice — only this thread locks it.
                    Some(mut guard) => guard.process(data),
                    None => data.to_vec(),
                },
                None => data.to_vec(),
            };

            // Level metric for visualisation, off the main data path.
            let level = mean_abs(&samples);
            level_bits.store(level.to_bits(), Ordering::Relaxed);

            if !crate::buffering::push_frame(&producer, AudioFrame::new(samples)) {
                warn!("frame queue full — dropping one driver block");
            }
        });

        let mut stream = match self.backend.open_input(
            &spec,
            self.config.preferred_device.as_deref(),
            callback,
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to start recording: {e}");
                let _ = self.capture_tx.send(CaptureEvent {
                    stage: CaptureStage::DeviceUnavailable,
                    detail: Some(e.to_string()),
                });
                return false;
            }
        };

        self.recording.store(true, Ordering::SeqCst);

        let collector = {
            let consumer = consumer.clone();
            let frames = Arc::clone(&frames);
            let recording = Arc::clone(&self.recording);
            let shutting_down = Arc::clone(&self.shutting_down);
            let level_bits = Arc::clone(&self.level_bits);
            let level_seq = Arc::clone(&self.level_seq);
            let level_tx = self.level_tx.clone();
            std::thread::Builder::new()
                .name("sotto-collector".into())
                .spawn(move || {
                    collect_loop(
                        &consumer,
                        &frames,
                        &recording,
                        &shutting_down,
                        &level_bits,
                        &level_seq,
                        &level_tx,
                    );
                })
        };

        let collector = match collector {
            Ok(handle) => handle,
            Err(e) => {
                // Roll the session back; a capture with no collector would
                // silently discard everything past the queue capacity.
                self.recording.store(false, Ordering::SeqCst);
                stream.close();
                warn!("failed to spawn collector thread: {e}");
                let _ = self.capture_tx.send(CaptureEvent {
                    stage: CaptureStage::DeviceUnavailable,
                    detail: Some(e.to_string()),
                });
                return false;
            }
        };

        session.stream = Some(stream);
        session.collector = Some(collector);
        session.queue = Some(consumer);
        session.frames = frames;

        info!(
            sample_rate = self.config.sample_rate,
            channels = self.config.channels,
            block_size = self.config.block_size,
            "recording started"
        );
        let _ = self.capture_tx.send(CaptureEvent {
            stage: CaptureStage::CaptureStarted,
            detail: None,
        });
        true
    }

    /// Stop the session and return the captured audio.
    ///
    /// Returns `None` when not recording, when nothing was captured, or when
    /// the capture is shorter than the minimum viable duration — all normal
    /// outcomes, not errors.
    pub fn stop(&self) -> Option<AudioBuffer> {
        let mut session = self.session.lock();

        if !self.recording.load(Ordering::SeqCst) {
            return None;
        }

        // Two-phase: clear `recording`, raise `shutting_down`. Both are set
        // before the stream is touched, so a callback firing mid-teardown
        // observes at least one of them and stays out of the write path.
        self.recording.store(false, Ordering::SeqCst);
        self.shutting_down.store(true, Ordering::SeqCst);

        if let Some(mut stream) = session.stream.take() {
            stream.close();
        }

        if let Some(handle) = session.collector.take() {
            join_with_limit(handle, COLLECTOR_JOIN_LIMIT);
        }

        let mut frames = std::mem::take(&mut *session.frames.lock());

        // Frames the collector never reached are still part of the capture.
        if let Some(queue) = session.queue.take() {
            while let Ok(frame) = queue.try_recv() {
                frames.push(frame);
            }
        }

        // Reset so the next start() behaves identically to the first.
        self.shutting_down.store(false, Ordering::SeqCst);

        let total: usize = frames.iter().map(AudioFrame::len).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in frames {
            samples.extend_from_slice(&frame.samples);
        }

        apply_gain(&mut samples, self.config.post_gain);

        let buffer = AudioBuffer::new(samples, self.config.sample_rate, self.config.channels);
        if buffer.is_empty() || buffer.duration_secs() < self.config.min_capture_secs as f64 {
            info!(
                duration_secs = buffer.duration_secs(),
                min_secs = self.config.min_capture_secs,
                "capture below minimum viable duration — nothing to transcribe"
            );
            let _ = self.capture_tx.send(CaptureEvent {
                stage: CaptureStage::CaptureDiscarded,
                detail: None,
            });
            return None;
        }

        info!(
            samples = buffer.samples.len(),
            duration_secs = buffer.duration_secs(),
            "recording stopped"
        );
        let _ = self.capture_tx.send(CaptureEvent {
            stage: CaptureStage::CaptureStopped,
            detail: None,
        });
        Some(buffer)
    }

    /// Whether a session is currently active.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Latest level metric (mean absolute amplitude of the newest frame).
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    /// Subscribe to level events for visualisation.
    pub fn subscribe_levels(&self) -> broadcast::Receiver<AudioLevelEvent> {
        self.level_tx.subscribe()
    }

    /// Subscribe to capture lifecycle events.
    pub fn subscribe_capture(&self) -> broadcast::Receiver<CaptureEvent> {
        self.capture_tx.subscribe()
    }
}

/// Single consumer of the frame queue for the lifetime of one session.
/// Exits cooperatively when the recording flag clears.
fn collect_loop(
    consumer: &FrameConsumer,
    frames: &Arc<Mutex<Vec<AudioFrame>>>,
    recording: &AtomicBool,
    shutting_down: &AtomicBool,
    level_bits: &AtomicU32,
    level_seq: &AtomicU64,
    level_tx: &broadcast::Sender<AudioLevelEvent>,
) {
    while recording.load(Ordering::SeqCst) && !shutting_down.load(Ordering::SeqCst) {
        match consumer.recv_timeout(COLLECTOR_POLL) {
            Ok(frame) => {
                frames.lock().push(frame);
                let _ = level_tx.send(AudioLevelEvent {
                    seq: level_seq.fetch_add(1, Ordering::Relaxed),
                    level: f32::from_bits(level_bits.load(Ordering::Relaxed)),
                });
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("collector thread exiting");
}

/// Wait for the collector to finish, detaching it if the bound is exceeded.
fn join_with_limit(handle: JoinHandle<()>, limit: Duration) {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() > limit {
            warn!("collector did not exit within {limit:?}; detaching");
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!("collector thread panicked");
    }
}

fn apply_gain(samples: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

fn mean_abs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}
