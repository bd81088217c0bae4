//! Hybrid transcription dispatch.
//!
//! A finished capture is routed to the local speech engine first and to the
//! remote service as a fallback (or the reverse, per configuration). The local
//! attempt runs in a disposable worker thread bounded by a hard deadline: an
//! engine that hangs is abandoned, never killed, and the dispatch moves on.
//!
//! Cancellation is delivery suppression, not interruption — in-flight engine
//! or network work runs to completion, but a cancelled request's result is
//! dropped instead of delivered. Submitting a new dispatch cancels the
//! previous one, so at most one result is ever live.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    buffering::frame::AudioBuffer,
    error::{Result, SottoError},
    ipc::events::{DispatchEvent, DispatchStage, Origin, TranscriptionEvent},
};

const BROADCAST_CAP: usize = 256;

/// Contract for local speech-to-text engines.
///
/// Implementations may be stateful (decoder caches, warm model weights), so
/// `transcribe` takes `&mut self`; the dispatcher serialises access through
/// `EngineHandle`.
pub trait LocalEngine: Send {
    /// Transcribe interleaved f32 samples at the given rate, returning the
    /// text and the engine's own processing time.
    ///
    /// Implementations may block for an unbounded time; the dispatcher
    /// imposes its own deadline rather than trusting the engine to honour
    /// one.
    ///
    /// # Errors
    /// Any engine-level failure; the dispatcher treats it as a local miss and
    /// falls back.
    fn transcribe(&mut self, samples: &[f32], sample_rate: u32)
        -> Result<(String, Duration)>;
}

/// Shared, lockable handle to the local engine.
///
/// The `Arc<Mutex<..>>` seam lets the orchestrator swap engines at runtime
/// and lets tests substitute scripted doubles.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<Mutex<dyn LocalEngine>>);

impl EngineHandle {
    pub fn new(engine: impl LocalEngine + 'static) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

/// Contract for the remote transcription path. Implemented by
/// `remote::RemoteClient` and by test doubles.
pub trait RemoteTranscriber: Send + Sync {
    /// Cheap availability probe; results may be cached by the implementation.
    fn check_health(&self) -> bool;

    /// Transcribe interleaved f32 samples at the given rate.
    ///
    /// # Errors
    /// Stage-specific remote errors (`RemoteUpload`, `RemoteStatus`, ...).
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String>;
}

/// Which path is attempted first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    #[default]
    LocalFirst,
    RemoteFirst,
}

/// Dispatch policy knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Hard deadline for one local attempt. A local engine that exceeds it is
    /// abandoned, not killed.
    pub local_timeout: Duration,
    /// Whether the remote path may be used at all.
    pub remote_fallback: bool,
    pub order: DispatchOrder,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            local_timeout: Duration::from_secs(20),
            remote_fallback: true,
            order: DispatchOrder::LocalFirst,
        }
    }
}

/// Per-request handle returned by `dispatch()`.
pub struct DispatchHandle {
    pub request_id: u64,
    cancel: Arc<AtomicBool>,
    result: crossbeam_channel::Receiver<Result<TranscriptionEvent>>,
}

impl DispatchHandle {
    /// Suppress delivery of this request's result. In-flight work is not
    /// interrupted.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the terminal result. `None` means the request was cancelled
    /// (the worker dropped the channel without delivering) or the wait timed
    /// out.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<TranscriptionEvent>> {
        self.result.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Result<TranscriptionEvent>> {
        self.result.try_recv().ok()
    }
}

/// Routes captures across the local and remote transcription paths.
pub struct TranscriptionDispatcher {
    engine: Option<EngineHandle>,
    remote: Option<Arc<dyn RemoteTranscriber>>,
    config: DispatchConfig,
    events_tx: broadcast::Sender<DispatchEvent>,
    /// Cancel flag of the most recent dispatch; replaced (and raised) by the
    /// next one.
    current_cancel: Mutex<Option<Arc<AtomicBool>>>,
    next_request_id: AtomicU64,
}

impl TranscriptionDispatcher {
    pub fn new(
        engine: Option<EngineHandle>,
        remote: Option<Arc<dyn RemoteTranscriber>>,
        config: DispatchConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            engine,
            remote,
            config,
            events_tx,
            current_cancel: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to dispatch state-machine events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events_tx.subscribe()
    }

    /// Submit a capture for transcription.
    ///
    /// Returns immediately; the work runs on a per-request worker thread.
    /// Any previously submitted request is cancelled.
    pub fn dispatch(&self, buffer: AudioBuffer) -> DispatchHandle {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(AtomicBool::new(false));

        // At most one live request: raising the predecessor's flag suppresses
        // its delivery even if its work is still running.
        if let Some(previous) = self.current_cancel.lock().replace(Arc::clone(&cancel)) {
            previous.store(true, Ordering::SeqCst);
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let worker = Worker {
            request_id,
            engine: self.engine.clone(),
            remote: self.remote.clone(),
            config: self.config.clone(),
            events_tx: self.events_tx.clone(),
            cancel: Arc::clone(&cancel),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("sotto-dispatch-{request_id}"))
            .spawn(move || worker.run(buffer, result_tx));
        if let Err(e) = spawned {
            warn!(request_id, "failed to spawn dispatch worker: {e}");
        }

        DispatchHandle {
            request_id,
            cancel,
            result: result_rx,
        }
    }
}

struct Worker {
    request_id: u64,
    engine: Option<EngineHandle>,
    remote: Option<Arc<dyn RemoteTranscriber>>,
    config: DispatchConfig,
    events_tx: broadcast::Sender<DispatchEvent>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    fn run(
        self,
        buffer: AudioBuffer,
        result_tx: crossbeam_channel::Sender<Result<TranscriptionEvent>>,
    ) {
        let started = Instant::now();
        self.emit(DispatchStage::Submitted, None);

        let sample_rate = buffer.sample_rate;
        let samples: Arc<Vec<f32>> = Arc::new(buffer.samples);

        let mut local_err: Option<SottoError> = None;
        let mut remote_err: Option<SottoError> = None;
        let mut outcome: Option<(String, Origin)> = None;

        let paths: [Origin; 2] = match self.config.order {
            DispatchOrder::LocalFirst => [Origin::Local, Origin::Remote],
            DispatchOrder::RemoteFirst => [Origin::Remote, Origin::Local],
        };

        for path in paths {
            if outcome.is_some() {
                break;
            }
            match path {
                Origin::Local if self.engine.is_some() => {
                    match self.try_local(&samples, sample_rate) {
                        Ok(text) => outcome = Some((text, Origin::Local)),
                        Err(e) => local_err = Some(e),
                    }
                }
                Origin::Remote if self.config.remote_fallback && self.remote.is_some() => {
                    match self.try_remote(&samples, sample_rate) {
                        Ok(text) => outcome = Some((text, Origin::Remote)),
                        Err(e) => remote_err = Some(e),
                    }
                }
                // Path not configured; it contributes no failure cause.
                _ => {}
            }
        }

        // Cancellation is checked once, immediately before delivery, so a
        // cancelled request's result is dropped no matter when the flag rose.
        if self.cancel.load(Ordering::SeqCst) {
            info!(request_id = self.request_id, "dispatch cancelled; result dropped");
            self.emit(DispatchStage::Cancelled, None);
            return;
        }

        match outcome {
            Some((text, origin)) => {
                let event = TranscriptionEvent {
                    request_id: self.request_id,
                    text,
                    origin,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                info!(
                    request_id = self.request_id,
                    origin = ?origin,
                    elapsed_ms = event.elapsed_ms,
                    "transcription complete"
                );
                self.emit(DispatchStage::Completed, None);
                let _ = result_tx.send(Ok(event));
            }
            None => {
                // A path that was never configured contributes no cause; the
                // terminal error names only what was actually attempted.
                let err = match (local_err, remote_err) {
                    (Some(local), Some(remote)) => SottoError::AllPathsFailed {
                        local: local.to_string(),
                        remote: remote.to_string(),
                    },
                    (Some(local), None) => local,
                    (None, Some(remote)) => remote,
                    (None, None) => {
                        SottoError::Engine("no transcription path configured".into())
                    }
                };
                warn!(request_id = self.request_id, "transcription failed: {err}");
                self.emit(DispatchStage::Failed, Some(err.to_string()));
                let _ = result_tx.send(Err(err));
            }
        }
    }

    /// One local attempt under the hard deadline.
    ///
    /// The engine runs in its own disposable thread; on timeout that thread
    /// is abandoned to finish (or hang) on its own while the dispatch
    /// proceeds. The engine mutex stays held by the abandoned thread until it
    /// returns, which also keeps a wedged engine from being re-entered.
    fn try_local(&self, samples: &Arc<Vec<f32>>, sample_rate: u32) -> Result<String> {
        let engine = match &self.engine {
            Some(handle) => handle.clone(),
            None => return Err(SottoError::Engine("no local engine configured".into())),
        };

        self.emit(DispatchStage::LocalAttempt, None);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker_samples = Arc::clone(samples);
        let spawned = std::thread::Builder::new()
            .name(format!("sotto-local-{}", self.request_id))
            .spawn(move || {
                let out = engine.0.lock().transcribe(&worker_samples, sample_rate);
                let _ = tx.send(out);
            });
        if let Err(e) = spawned {
            let err = SottoError::Engine(format!("failed to spawn engine thread: {e}"));
            self.emit(DispatchStage::LocalFailed, Some(err.to_string()));
            return Err(err);
        }

        match rx.recv_timeout(self.config.local_timeout) {
            Ok(Ok((text, _))) if text.trim().is_empty() => {
                let err = SottoError::Engine("engine produced an empty transcript".into());
                self.emit(DispatchStage::LocalFailed, Some(err.to_string()));
                Err(err)
            }
            Ok(Ok((text, engine_elapsed))) => {
                info!(
                    request_id = self.request_id,
                    engine_ms = engine_elapsed.as_millis() as u64,
                    "local engine succeeded"
                );
                Ok(text)
            }
            Ok(Err(e)) => {
                self.emit(DispatchStage::LocalFailed, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                let err = SottoError::EngineTimeout(self.config.local_timeout);
                warn!(
                    request_id = self.request_id,
                    timeout = ?self.config.local_timeout,
                    "local engine missed its deadline; abandoning the attempt"
                );
                self.emit(DispatchStage::LocalTimeout, Some(err.to_string()));
                Err(err)
            }
        }
    }

    fn try_remote(&self, samples: &Arc<Vec<f32>>, sample_rate: u32) -> Result<String> {
        let remote = match &self.remote {
            Some(remote) => Arc::clone(remote),
            None => return Err(SottoError::Engine("no remote service configured".into())),
        };

        if !remote.check_health() {
            let err = SottoError::RemoteUnavailable;
            self.emit(DispatchStage::RemoteFailed, Some(err.to_string()));
            return Err(err);
        }

        self.emit(DispatchStage::RemoteAttempt, None);
        match remote.transcribe(samples, sample_rate) {
            Ok(text) => Ok(text),
            Err(e) => {
                self.emit(DispatchStage::RemoteFailed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn emit(&self, stage: DispatchStage, detail: Option<String>) {
        let _ = self.events_tx.send(DispatchEvent {
            request_id: self.request_id,
            stage,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn short_buffer() -> AudioBuffer {
        AudioBuffer::new(vec![0.1; 16_000], 16_000, 1)
    }

    struct ScriptedEngine {
        text: &'static str,
        delay: Duration,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedEngine {
        fn instant(text: &'static str) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    text,
                    delay: Duration::ZERO,
                    fail: false,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }

        fn slow(text: &'static str, delay: Duration) -> (Self, Arc<AtomicUsize>) {
            let (mut engine, calls) = Self::instant(text);
            engine.delay = delay;
            (engine, calls)
        }

        fn failing() -> (Self, Arc<AtomicUsize>) {
            let (mut engine, calls) = Self::instant("");
            engine.fail = true;
            (engine, calls)
        }
    }

    impl LocalEngine for ScriptedEngine {
        fn transcribe(
            &mut self,
            _samples: &[f32],
            _sample_rate: u32,
        ) -> Result<(String, Duration)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail {
                return Err(SottoError::Engine("decoder fault".into()));
            }
            Ok((self.text.to_string(), self.delay))
        }
    }

    struct MockRemote {
        healthy: bool,
        response: std::result::Result<&'static str, &'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl MockRemote {
        fn returning(text: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    healthy: true,
                    response: Ok(text),
                    calls: Arc::clone(&calls),
                }),
                calls,
            )
        }

        fn failing(message: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    healthy: true,
                    response: Err(message),
                    calls: Arc::clone(&calls),
                }),
                calls,
            )
        }
    }

    impl RemoteTranscriber for MockRemote {
        fn check_health(&self) -> bool {
            self.healthy
        }

        fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.response {
                Ok(text) => Ok(text.to_string()),
                Err(message) => Err(SottoError::RemoteUpload(message.into())),
            }
        }
    }

    fn quick_config() -> DispatchConfig {
        DispatchConfig {
            local_timeout: Duration::from_millis(100),
            ..DispatchConfig::default()
        }
    }

    /// Poll the event channel until `pred` matches or the timeout elapses.
    fn wait_for_stage(
        rx: &mut broadcast::Receiver<DispatchEvent>,
        wanted: DispatchStage,
        timeout: Duration,
    ) -> Option<DispatchEvent> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(event) if event.stage == wanted => return Some(event),
                Ok(_) => continue,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        None
    }

    #[test]
    fn local_success_never_touches_remote() {
        let (engine, _) = ScriptedEngine::instant("typed locally");
        let (remote, remote_calls) = MockRemote::returning("unused");
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            quick_config(),
        );

        let handle = dispatcher.dispatch(short_buffer());
        let result = handle
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect("dispatch succeeded");

        assert_eq!(result.text, "typed locally");
        assert_eq!(result.origin, Origin::Local);
        assert_eq!(remote_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn local_timeout_falls_back_to_remote() {
        let (engine, local_calls) = ScriptedEngine::slow("late", Duration::from_millis(400));
        let (remote, remote_calls) = MockRemote::returning("from the cloud");
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            quick_config(),
        );
        let mut events = dispatcher.subscribe();

        let handle = dispatcher.dispatch(short_buffer());
        let result = handle
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect("remote fallback succeeded");

        assert_eq!(result.text, "from the cloud");
        assert_eq!(result.origin, Origin::Remote);
        assert_eq!(local_calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote_calls.load(Ordering::SeqCst), 1);

        let timeout = Duration::from_secs(2);
        assert!(wait_for_stage(&mut events, DispatchStage::LocalAttempt, timeout).is_some());
        assert!(wait_for_stage(&mut events, DispatchStage::LocalTimeout, timeout).is_some());
        assert!(wait_for_stage(&mut events, DispatchStage::RemoteAttempt, timeout).is_some());
        assert!(wait_for_stage(&mut events, DispatchStage::Completed, timeout).is_some());
    }

    #[test]
    fn empty_local_transcript_counts_as_a_local_failure() {
        let (engine, _) = ScriptedEngine::instant("   ");
        let (remote, remote_calls) = MockRemote::returning("real words");
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            quick_config(),
        );

        let result = dispatcher
            .dispatch(short_buffer())
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect("fallback succeeded");

        assert_eq!(result.origin, Origin::Remote);
        assert_eq!(remote_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_paths_failed_reports_both_causes() {
        let (engine, _) = ScriptedEngine::failing();
        let (remote, _) = MockRemote::failing("bucket is gone");
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            quick_config(),
        );

        let err = dispatcher
            .dispatch(short_buffer())
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect_err("both paths should fail");

        match err {
            SottoError::AllPathsFailed { local, remote } => {
                assert!(local.contains("decoder fault"), "local cause: {local}");
                assert!(remote.contains("bucket is gone"), "remote cause: {remote}");
            }
            other => panic!("expected AllPathsFailed, got {other}"),
        }
    }

    #[test]
    fn unhealthy_remote_is_not_called() {
        let (engine, _) = ScriptedEngine::failing();
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = Arc::new(MockRemote {
            healthy: false,
            response: Ok("unreachable"),
            calls: Arc::clone(&calls),
        });
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            quick_config(),
        );

        let err = dispatcher
            .dispatch(short_buffer())
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect_err("no path should succeed");

        assert!(matches!(err, SottoError::AllPathsFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_fallback_surfaces_the_local_failure_alone() {
        let (engine, _) = ScriptedEngine::slow("late", Duration::from_millis(400));
        let (remote, remote_calls) = MockRemote::returning("unreachable");
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            DispatchConfig {
                remote_fallback: false,
                ..quick_config()
            },
        );

        let err = dispatcher
            .dispatch(short_buffer())
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect_err("local timeout with fallback disabled is terminal");

        assert!(matches!(err, SottoError::EngineTimeout(_)), "{err}");
        assert_eq!(remote_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_suppresses_delivery_but_not_work() {
        let (engine, local_calls) = ScriptedEngine::slow("too late", Duration::from_millis(80));
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            None,
            DispatchConfig {
                remote_fallback: false,
                local_timeout: Duration::from_secs(2),
                ..DispatchConfig::default()
            },
        );
        let mut events = dispatcher.subscribe();

        let handle = dispatcher.dispatch(short_buffer());
        handle.cancel();

        assert!(handle.recv_timeout(Duration::from_millis(500)).is_none());
        assert!(
            wait_for_stage(&mut events, DispatchStage::Cancelled, Duration::from_secs(2)).is_some()
        );
        // The engine still ran; only delivery was suppressed.
        assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn new_dispatch_cancels_the_previous_one() {
        let (slow_engine, _) = ScriptedEngine::slow("first", Duration::from_millis(150));
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(slow_engine)),
            None,
            DispatchConfig {
                remote_fallback: false,
                local_timeout: Duration::from_secs(2),
                ..DispatchConfig::default()
            },
        );

        let first = dispatcher.dispatch(short_buffer());
        let second = dispatcher.dispatch(short_buffer());

        let result = second
            .recv_timeout(Duration::from_secs(3))
            .expect("second result delivered")
            .expect("second dispatch succeeded");
        assert_eq!(result.text, "first");
        assert!(first.recv_timeout(Duration::from_millis(300)).is_none());
    }

    #[test]
    fn remote_first_order_skips_the_local_engine() {
        let (engine, local_calls) = ScriptedEngine::instant("local words");
        let (remote, remote_calls) = MockRemote::returning("cloud words");
        let dispatcher = TranscriptionDispatcher::new(
            Some(EngineHandle::new(engine)),
            Some(remote),
            DispatchConfig {
                order: DispatchOrder::RemoteFirst,
                ..quick_config()
            },
        );

        let result = dispatcher
            .dispatch(short_buffer())
            .recv_timeout(Duration::from_secs(2))
            .expect("result delivered")
            .expect("remote succeeded");

        assert_eq!(result.text, "cloud words");
        assert_eq!(result.origin, Origin::Remote);
        assert_eq!(remote_calls.load(Ordering::SeqCst), 1);
        assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    }
}
