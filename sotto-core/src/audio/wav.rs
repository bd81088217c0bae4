//! f32 → 16-bit PCM WAV encoding.

use std::path::Path;

use crate::error::{Result, SottoError};

/// Write interleaved f32 samples as a 16-bit PCM WAV file.
///
/// # Errors
/// Returns `SottoError::WavEncode` if hound fails to create or finalize
/// the file.
pub fn write_pcm16_wav(
    path: &Path,
    samples: &[f32],
    sample_rate: u32,
    channels: u16,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| SottoError::WavEncode(e.to_string()))?;

    for &sample in samples {
        let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(pcm)
            .map_err(|e| SottoError::WavEncode(e.to_string()))?;
    }

    writer
        .finalize()
        .map_err(|e| SottoError::WavEncode(e.to_string()))?;
    Ok(())
}
