//! Audio device abstraction.
//!
//! The capture engine talks to the device through `AudioBackend`, which hides
//! cpal behind a trait so sessions can be driven by a fake backend in tests
//! (no hardware, deterministic callback timing).
//!
//! # Real-time contract
//!
//! The callback handed to `open_input` runs on the OS audio thread at
//! elevated priority. It must not allocate unboundedly, block on a mutex or
//! condvar, or perform I/O. The engine's callback satisfies this by copying
//! the block, doing an uncontended `try_lock` for conditioning, and a
//! `try_send` onto the bounded frame queue.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). The stream handle is therefore created and dropped on the thread
//! that calls `start()`/`stop()` — only frames cross thread boundaries.

use crate::error::Result;

/// Sample-level description of the stream the engine wants opened.
#[derive(Debug, Clone, Copy)]
pub struct StreamSpec {
    /// Requested sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames per driver callback.
    pub block_size: u32,
}

/// Callback invoked by the driver thread with each interleaved f32 block.
pub type DriverCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Handle to one open device stream.
pub trait InputStream {
    /// Stop and release the device. Idempotent.
    fn close(&mut self);
}

/// Opens input streams. Implemented by `CpalBackend` and by test doubles.
pub trait AudioBackend: Send + Sync {
    /// Open an input stream and begin delivering blocks to `callback`.
    ///
    /// # Errors
    /// Returns `SottoError::NoInputDevice` when no device matches, or
    /// `SottoError::AudioDevice` / `SottoError::AudioStream` on open failure.
    fn open_input(
        &self,
        spec: &StreamSpec,
        preferred_device: Option<&str>,
        callback: DriverCallback,
    ) -> Result<Box<dyn InputStream>>;
}

#[cfg(feature = "audio-cpal")]
pub use cpal_backend::CpalBackend;

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleRate, Stream, StreamConfig,
    };
    use tracing::{error, info, warn};

    use super::{AudioBackend, DriverCallback, InputStream, StreamSpec};
    use crate::error::{Result, SottoError};

    /// Production backend over the system's default cpal host.
    pub struct CpalBackend;

    impl CpalBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for CpalBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    struct CpalInputStream {
        stream: Option<Stream>,
    }

    impl InputStream for CpalInputStream {
        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                if let Err(e) = stream.pause() {
                    warn!("failed to pause input stream on close: {e}");
                }
                drop(stream);
            }
        }
    }

    impl AudioBackend for CpalBackend {
        fn open_input(
            &self,
            spec: &StreamSpec,
            preferred_device: Option<&str>,
            callback: DriverCallback,
        ) -> Result<Box<dyn InputStream>> {
            let host = cpal::default_host();

            let mut selected_device = None;
            if let Some(preferred_name) = preferred_device {
                match host.input_devices() {
                    Ok(mut devices) => {
                        selected_device = devices.find(|device| {
                            device
                                .name()
                                .map(|name| name == preferred_name)
                                .unwrap_or(false)
                        });
                        if selected_device.is_none() {
                            warn!(
                                "preferred input device '{}' not found, falling back",
                                preferred_name
                            );
                        }
                    }
                    Err(e) => {
                        warn!("failed to list input devices while resolving preference: {e}");
                    }
                }
            }

            let device = match selected_device.or_else(|| host.default_input_device()) {
                Some(d) => d,
                None => return Err(SottoError::NoInputDevice),
            };

            info!(
                device = device.name().unwrap_or_default().as_str(),
                sample_rate = spec.sample_rate,
                channels = spec.channels,
                block_size = spec.block_size,
                "opening input device"
            );

            // Request f32 at the configured rate with a fixed block size; if
            // the driver refuses the fixed size, retry with its default.
            // The callback is shared through an uncontended mutex so the
            // failed first attempt does not consume it; only the one live
            // driver thread ever takes this lock.
            let shared = std::sync::Arc::new(parking_lot::Mutex::new(callback));

            let fixed = StreamConfig {
                channels: spec.channels,
                sample_rate: SampleRate(spec.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(spec.block_size),
            };

            let stream = match build_f32_stream(&device, &fixed, &shared) {
                Ok(s) => s,
                Err(first) => {
                    warn!("fixed block size rejected ({first}), retrying with device default");
                    let relaxed = StreamConfig {
                        buffer_size: cpal::BufferSize::Default,
                        ..fixed
                    };
                    build_f32_stream(&device, &relaxed, &shared)
                        .map_err(SottoError::AudioStream)?
                }
            };

            stream
                .play()
                .map_err(|e| SottoError::AudioStream(e.to_string()))?;

            Ok(Box::new(CpalInputStream {
                stream: Some(stream),
            }))
        }
    }

    fn build_f32_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        callback: &std::sync::Arc<parking_lot::Mutex<DriverCallback>>,
    ) -> std::result::Result<Stream, String> {
        let forward = std::sync::Arc::clone(callback);
        device
            .build_input_stream(
                config,
                move |data: &[f32], _info| (forward.lock())(data),
                |err| error!("audio stream error: {err}"),
                None,
            )
            .map_err(|e| e.to_string())
    }
}
