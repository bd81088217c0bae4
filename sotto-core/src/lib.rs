//! # sotto-core
//!
//! Reusable push-to-talk voice-to-text core.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureEngine → bounded frame queue → collector thread
//!                                                         │
//!                                              stop() → AudioBuffer
//!                                                         │
//!                                             TranscriptionDispatcher
//!                                               │                │
//!                                        LocalEngine     RemoteClient
//!                                               └───────┬────────┘
//!                                           broadcast + DispatchHandle
//! ```
//!
//! The audio callback never blocks. All heap work happens on the collector
//! and dispatch worker threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod remote;

// Convenience re-exports for downstream crates
pub use audio::denoise::{NoiseConditioner, NoiseSuppressor};
pub use audio::{backend::AudioBackend, CaptureConfig, CaptureEngine};
pub use buffering::frame::AudioBuffer;
pub use dispatch::{
    DispatchConfig, DispatchHandle, DispatchOrder, EngineHandle, LocalEngine, RemoteTranscriber,
    TranscriptionDispatcher,
};
pub use error::SottoError;
pub use ipc::events::{
    AudioLevelEvent, CaptureEvent, CaptureStage, DispatchEvent, DispatchStage, Origin,
    TranscriptionEvent,
};
pub use remote::{RemoteClient, RemoteClientConfig};

#[cfg(feature = "audio-cpal")]
pub use audio::backend::CpalBackend;
