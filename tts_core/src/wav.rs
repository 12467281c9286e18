use std::io::Cursor;

use anyhow::Context;

/// Encode PCM f32 samples as a 16-bit mono PCM WAV (RIFF) container.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // WAV header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("wav header write")?;
        const I16_MAX_F32: f32 = i16::MAX as f32;
        for &s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16)
                .context("wav sample write")?;
        }
        // finalize patches the RIFF and data chunk sizes
        writer.finalize().context("wav finalize")?;
    }
    Ok(cursor.into_inner())
}
