//! Error taxonomy for the synthesis core.

use thiserror::Error;

/// Result type alias using [`TtsError`].
pub type Result<T> = std::result::Result<T, TtsError>;

#[derive(Debug, Error)]
pub enum TtsError {
    /// Rejected before any cache or model work (empty text, bad speed, bad voice id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No model asset exists for the voice id
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The asset exists but the backend could not load it
    #[error("Failed to load model '{voice_id}': {source:#}")]
    ModelLoad {
        voice_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Synthesis failed: {0:#}")]
    SynthesisFailed(#[source] anyhow::Error),

    /// Produced or cached bytes are not a readable WAV container
    #[error("Malformed audio: {0}")]
    MalformedAudio(String),
}

impl TtsError {
    /// True for errors caused by the caller rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, TtsError::InvalidRequest(_))
    }
}
