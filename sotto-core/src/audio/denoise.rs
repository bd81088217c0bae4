//! Real-time noise conditioning for driver-callback frames.
//!
//! Suppression backends (WebRTC-style processors and friends) only accept
//! frames of one exact duration — typically 10 ms. Driver blocks are whatever
//! the device hands us, so `NoiseConditioner` splits each block into
//! primitive-sized chunks, zero-pads the final remainder, and reassembles the
//! processed chunks back to the original sample count.
//!
//! A conditioning failure must never cost audio: any primitive error makes
//! the call a recoverable miss that returns the input unchanged.

use tracing::{debug, warn};

use crate::error::Result;

/// Contract for noise-suppression backends.
///
/// Implementations accept exactly `frame_len()` samples per call and return
/// the same number of processed samples. They may be stateful (adaptive gain,
/// noise floor estimates), so `process_frame` takes `&mut self`.
pub trait NoiseSuppressor: Send + 'static {
    /// The exact frame length this primitive accepts, in samples.
    fn frame_len(&self) -> usize;

    /// Process one frame of exactly `frame_len()` samples.
    ///
    /// # Errors
    /// Implementations may fail per-call; the conditioner treats any error as
    /// a miss for the whole block.
    fn process_frame(&mut self, frame: &[f32]) -> Result<Vec<f32>>;
}

/// Splits arbitrary-length blocks into primitive-sized frames and back.
pub struct NoiseConditioner {
    suppressor: Box<dyn NoiseSuppressor>,
    scratch: Vec<f32>,
}

impl NoiseConditioner {
    pub fn new(suppressor: Box<dyn NoiseSuppressor>) -> Self {
        Self {
            suppressor,
            scratch: Vec::new(),
        }
    }

    /// Condition one driver block.
    ///
    /// Postcondition: the output always has exactly `input.len()` samples —
    /// downstream stages assume length is preserved. On any primitive error
    /// the original input is returned unmodified.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let chunk = self.suppressor.frame_len();
        if chunk == 0 || input.is_empty() {
            return input.to_vec();
        }

        self.scratch.clear();
        self.scratch.reserve(input.len());

        for piece in input.chunks(chunk) {
            let processed = if piece.len() == chunk {
                self.suppressor.process_frame(piece)
            } else {
                // Zero-pad the undersized remainder up to one full frame.
                let mut padded = vec![0.0f32; chunk];
                padded[..piece.len()].copy_from_slice(piece);
                self.suppressor.process_frame(&padded)
            };

            match processed {
                Ok(out) if out.len() >= piece.len() => {
                    // Drop padding so output length tracks input length.
                    self.scratch.extend_from_slice(&out[..piece.len()]);
                }
                Ok(out) => {
                    warn!(
                        got = out.len(),
                        expected = piece.len(),
                        "suppressor returned a short frame; passing block through"
                    );
                    return input.to_vec();
                }
                Err(e) => {
                    debug!(error = %e, "noise suppression miss; passing block through");
                    return input.to_vec();
                }
            }
        }

        debug_assert_eq!(self.scratch.len(), input.len());
        self.scratch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SottoError;

    /// Inverts every sample so processed output is distinguishable.
    struct InvertingSuppressor {
        frame_len: usize,
        calls: usize,
    }

    impl NoiseSuppressor for InvertingSuppressor {
        fn frame_len(&self) -> usize {
            self.frame_len
        }

        fn process_frame(&mut self, frame: &[f32]) -> Result<Vec<f32>> {
            self.calls += 1;
            Ok(frame.iter().map(|s| -s).collect())
        }
    }

    struct FailingSuppressor;

    impl NoiseSuppressor for FailingSuppressor {
        fn frame_len(&self) -> usize {
            160
        }

        fn process_frame(&mut self, _frame: &[f32]) -> Result<Vec<f32>> {
            Err(SottoError::Engine("suppressor exploded".into()))
        }
    }

    #[test]
    fn output_length_matches_input_for_exact_multiple() {
        let mut cond = NoiseConditioner::new(Box::new(InvertingSuppressor {
            frame_len: 160,
            calls: 0,
        }));

        let input = vec![0.5f32; 480];
        let out = cond.process(&input);

        assert_eq!(out.len(), input.len());
        assert!(out.iter().all(|&s| (s + 0.5).abs() < 1e-6));
    }

    #[test]
    fn output_length_matches_input_with_undersized_remainder() {
        let mut cond = NoiseConditioner::new(Box::new(InvertingSuppressor {
            frame_len: 160,
            calls: 0,
        }));

        // 330 = 2 full frames + 10-sample remainder that must be padded.
        let input: Vec<f32> = (0..330).map(|i| i as f32 / 330.0).collect();
        let out = cond.process(&input);

        assert_eq!(out.len(), 330);
        // Remainder content processed, padding discarded.
        assert!((out[329] + input[329]).abs() < 1e-6);
    }

    #[test]
    fn primitive_failure_returns_input_unchanged() {
        let mut cond = NoiseConditioner::new(Box::new(FailingSuppressor));

        let input = vec![0.25f32; 1024];
        let out = cond.process(&input);

        assert_eq!(out, input);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let mut cond = NoiseConditioner::new(Box::new(InvertingSuppressor {
            frame_len: 160,
            calls: 0,
        }));
        assert!(cond.process(&[]).is_empty());
    }

    #[test]
    fn block_smaller_than_one_frame_is_padded_and_trimmed() {
        let mut cond = NoiseConditioner::new(Box::new(InvertingSuppressor {
            frame_len: 160,
            calls: 0,
        }));

        let input = vec![0.1f32; 48];
        let out = cond.process(&input);

        assert_eq!(out.len(), 48);
        assert!(out.iter().all(|&s| (s + 0.1).abs() < 1e-6));
    }
}
