//! Synthesis engine: normalized text + voice model + speed -> WAV bytes.

use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::error::{Result, TtsError};
use crate::registry::VoiceModel;
use crate::text::{self, Chunk};
use crate::wav;

#[derive(Debug, Clone, Copy)]
pub struct SynthesisEngine {
    /// Split at punctuation and insert silence between chunks
    natural_pauses: bool,
}

impl Default for SynthesisEngine {
    fn default() -> Self {
        Self {
            natural_pauses: true,
        }
    }
}

impl SynthesisEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_natural_pauses(mut self, enabled: bool) -> Self {
        self.natural_pauses = enabled;
        self
    }

    /// Render `text` with `model` as a mono 16-bit WAV.
    ///
    /// `speed` is handed to the backend as `length_scale = 1 / speed`. The text
    /// must already be validated; it is only normalized here. Backend errors are
    /// returned as `SynthesisFailed` and never retried.
    pub async fn synthesize(
        &self,
        model: &Arc<VoiceModel>,
        text: &str,
        speed: f32,
    ) -> Result<Vec<u8>> {
        let model = Arc::clone(model);
        let text = text::normalize_for_speech(text);
        let length_scale = 1.0 / speed;
        let natural_pauses = self.natural_pauses;

        tokio::task::spawn_blocking(move || render(&model, &text, length_scale, natural_pauses))
            .await
            .map_err(|e| TtsError::SynthesisFailed(anyhow::anyhow!("synthesis task failed: {e}")))?
    }
}

fn render(model: &VoiceModel, text: &str, length_scale: f32, natural_pauses: bool) -> Result<Vec<u8>> {
    let sample_rate = model.sample_rate();
    let chunks = if natural_pauses {
        text::split_into_chunks(text)
    } else {
        vec![Chunk {
            text: text.to_string(),
            pause_after_ms: 0,
        }]
    };

    let mut samples: Vec<f32> = Vec::new();
    for chunk in &chunks {
        let part = model
            .backend()
            .synthesize(&chunk.text, length_scale)
            .with_context(|| format!("voice '{}' failed on chunk {:?}", model.voice_id(), chunk.text))
            .map_err(TtsError::SynthesisFailed)?;
        samples.extend(part);

        if chunk.pause_after_ms > 0 {
            let pause = (chunk.pause_after_ms as f32 / 1000.0 * sample_rate as f32 * length_scale) as usize;
            samples.resize(samples.len() + pause, 0.0);
        }
    }

    debug!(
        voice = %model.voice_id(),
        chunks = chunks.len(),
        samples = samples.len(),
        "Rendered speech"
    );
    wav::encode_wav(&samples, sample_rate).map_err(TtsError::SynthesisFailed)
}
