//! Synthesis request and result types.

use serde::Serialize;

use crate::error::{Result, TtsError};

/// Maximum text length for synthesis requests
pub const MAX_TEXT_LENGTH: usize = 5000;
/// Accepted speed range; output length scales with `1 / speed`
pub const MIN_SPEED: f32 = 0.1;
pub const MAX_SPEED: f32 = 10.0;
/// Voice used when a request does not name one
pub const DEFAULT_VOICE: &str = "en_US-lessac-medium";

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    /// Playback speed factor; higher means shorter audio
    pub speed: f32,
    /// Request-scoped opt-out of the persisted cache
    pub use_cache: bool,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: voice_id.into(),
            speed: 1.0,
            use_cache: true,
        }
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Check the request invariants. Must pass before any cache or model work.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(TtsError::InvalidRequest("Text cannot be empty".to_string()));
        }
        let len = self.text.chars().count();
        if len > MAX_TEXT_LENGTH {
            return Err(TtsError::InvalidRequest(format!(
                "Text too long ({} characters, max {})",
                len, MAX_TEXT_LENGTH
            )));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.speed) {
            return Err(TtsError::InvalidRequest(format!(
                "Speed must be between {MIN_SPEED} and {MAX_SPEED}, got {}",
                self.speed
            )));
        }
        if !is_valid_voice_id(&self.voice_id) {
            return Err(TtsError::InvalidRequest(format!(
                "Invalid voice id: '{}'",
                self.voice_id
            )));
        }
        Ok(())
    }
}

/// Voice ids name files in the model directory, so they are restricted to a
/// path-safe alphabet (e.g. `en_US-lessac-medium`).
pub fn is_valid_voice_id(voice_id: &str) -> bool {
    !voice_id.is_empty()
        && !voice_id.contains("..")
        && voice_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisResult {
    #[serde(skip)]
    pub audio: Vec<u8>,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub cached: bool,
    pub voice_id: String,
}
