//! Cached Piper text-to-speech.
//!
//! A [`TtsManager`] ties together the [`VoiceModelRegistry`] (lazy, load-once
//! voice models), the [`SynthesisEngine`] (text to WAV bytes), the
//! [`SynthesisCache`] (content-addressed, single-flight) and the header-only
//! [`probe`]. A request is validated, looked up by its cache key and, on a
//! miss, synthesized with the resolved model and persisted.

pub mod cache;
pub mod engine;
pub mod error;
pub mod piper;
pub mod probe;
pub mod registry;
pub mod request;
pub mod text;
pub mod wav;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

pub use cache::{AudioStore, CacheKey, FsStore, MemoryStore, SynthesisCache};
pub use engine::SynthesisEngine;
pub use error::{Result, TtsError};
pub use piper::PiperLoader;
pub use probe::AudioInfo;
pub use registry::{ModelAsset, ModelLoader, SpeechBackend, VoiceModel, VoiceModelRegistry};
pub use request::{
    SynthesisRequest, SynthesisResult, DEFAULT_VOICE, MAX_SPEED, MAX_TEXT_LENGTH, MIN_SPEED,
};

#[derive(Clone)]
pub struct TtsManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: VoiceModelRegistry,
    engine: SynthesisEngine,
    cache: SynthesisCache,
    default_voice: String,
}

impl TtsManager {
    pub fn new(
        registry: VoiceModelRegistry,
        engine: SynthesisEngine,
        cache: SynthesisCache,
        default_voice: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                engine,
                cache,
                default_voice: default_voice.into(),
            }),
        }
    }

    pub fn default_voice(&self) -> &str {
        &self.inner.default_voice
    }

    pub fn registry(&self) -> &VoiceModelRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &SynthesisCache {
        &self.inner.cache
    }

    /// Voice ids present in the model directory (loaded or not).
    pub fn available_voices(&self) -> Vec<String> {
        self.inner.registry.available_voices()
    }

    pub fn loaded_models(&self) -> usize {
        self.inner.registry.loaded_count()
    }

    /// Synthesize `request`, serving it from the cache when possible.
    ///
    /// Invalid requests are rejected before any cache or model work. The
    /// model is only resolved on a cache miss.
    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisResult> {
        request.validate()?;
        let started = Instant::now();

        let inner = Arc::clone(&self.inner);
        let voice_id = request.voice_id.clone();
        let text = request.text.clone();
        let speed = request.speed;
        let compute = move || async move {
            let model = inner.registry.resolve(&voice_id).await?;
            inner.engine.synthesize(&model, &text, speed).await
        };

        let (audio, cached) = self.inner.cache.get_or_compute(&request, compute).await?;
        let info = probe::inspect(&audio)?;

        info!(
            voice = %request.voice_id,
            cached,
            bytes = audio.len(),
            duration_secs = info.duration_secs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Synthesis complete"
        );
        Ok(SynthesisResult {
            audio,
            duration_secs: info.duration_secs,
            sample_rate: info.sample_rate,
            cached,
            voice_id: request.voice_id,
        })
    }
}
