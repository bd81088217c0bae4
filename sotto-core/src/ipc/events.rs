//! Observability events emitted by the core.
//!
//! The core emits named, typed events on `tokio::sync::broadcast` channels
//! and leaves persistence and formatting to whoever subscribes (GUI, CLI,
//! log shipper).
//!
//! | Event | Channel |
//! |-------|---------|
//! | `AudioLevelEvent` | `CaptureEngine::subscribe_levels` |
//! | `CaptureEvent` | `CaptureEngine::subscribe_capture` |
//! | `DispatchEvent` | `TranscriptionDispatcher::subscribe` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capture events
// ---------------------------------------------------------------------------

/// Microphone level metric for visualisation, independent of the audio data
/// path. `level` is the mean absolute amplitude of the most recent frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Mean absolute amplitude in [0.0, 1.0].
    pub level: f32,
}

/// Emitted when the capture session changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    pub stage: CaptureStage,
    /// Optional human-readable detail (e.g. device error message).
    pub detail: Option<String>,
}

/// Capture session lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStage {
    /// Device stream opened, collector running.
    CaptureStarted,
    /// Session closed with a usable buffer.
    CaptureStopped,
    /// Session closed but the capture was empty or below the minimum
    /// viable duration — nothing to transcribe, not an error.
    CaptureDiscarded,
    /// The device could not be opened.
    DeviceUnavailable,
}

// ---------------------------------------------------------------------------
// Dispatch events
// ---------------------------------------------------------------------------

/// Which transcription path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// Emitted at each transition of a dispatch attempt's state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    /// Identifies the request this event belongs to.
    pub request_id: u64,
    pub stage: DispatchStage,
    /// Optional human-readable detail (e.g. failure cause).
    pub detail: Option<String>,
}

/// Dispatch state-machine stages, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    Submitted,
    LocalAttempt,
    LocalTimeout,
    LocalFailed,
    RemoteAttempt,
    RemoteFailed,
    Completed,
    Failed,
    Cancelled,
}

/// The terminal payload of a successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEvent {
    /// Identifies the request this result belongs to.
    pub request_id: u64,
    /// Recognised text.
    pub text: String,
    /// Which path produced the text.
    pub origin: Origin,
    /// Wall-clock processing time in milliseconds.
    pub elapsed_ms: u64,
}
