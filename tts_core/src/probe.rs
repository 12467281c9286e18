//! Audio metadata from the WAV container header.
//!
//! Only the RIFF header and `fmt ` chunk are parsed; the payload is never
//! decoded, so probing a cached entry costs the same as probing fresh output.

use std::io::Cursor;

use serde::Serialize;

use crate::error::{Result, TtsError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Samples per channel
    pub frames: u32,
    pub duration_secs: f64,
}

/// Read the header fields of a WAV byte sequence.
pub fn inspect(bytes: &[u8]) -> Result<AudioInfo> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| TtsError::MalformedAudio(format!("unreadable WAV header: {e}")))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(TtsError::MalformedAudio("sample rate is zero".to_string()));
    }

    let frames = reader.duration();
    Ok(AudioInfo {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        frames,
        duration_secs: frames as f64 / spec.sample_rate as f64,
    })
}

/// Playable duration in seconds (`frames / sample_rate`).
pub fn duration(bytes: &[u8]) -> Result<f64> {
    inspect(bytes).map(|info| info.duration_secs)
}
