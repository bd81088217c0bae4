//! Typed audio blocks passed through the capture pipeline.

/// One driver-callback block of interleaved f32 samples.
///
/// Owned exclusively by whichever pipeline stage currently holds it
/// (callback → queue → collector); never shared by reference across threads.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A finished capture: every collected frame concatenated into one block.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Interleaved f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Capture sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Duration of the capture in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
