// Configuration for the server, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tts_core::DEFAULT_VOICE;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub models_dir: PathBuf,
    /// Directory for cached WAV files; `None` keeps entries in memory only.
    pub cache_dir: Option<PathBuf>,
    pub default_voice: String,
    pub preload_voices: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5002,
            models_dir: default_models_dir(),
            cache_dir: Some(PathBuf::from("/tmp/piper-cache")),
            default_voice: DEFAULT_VOICE.to_string(),
            preload_voices: Vec::new(),
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env_parse("PORT").unwrap_or(defaults.port);

        let models_dir = std::env::var("PIPER_MODELS_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.models_dir);

        let cache_dir = cache_dir_setting(std::env::var("PIPER_CACHE_DIR").ok(), defaults.cache_dir);

        let default_voice = std::env::var("DEFAULT_VOICE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.default_voice);

        let preload_voices = std::env::var("PRELOAD_VOICES")
            .ok()
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let rate_limit_per_minute =
            env_parse("RATE_LIMIT_PER_MINUTE").unwrap_or(defaults.rate_limit_per_minute);

        let request_timeout_secs =
            env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(defaults.request_timeout_secs);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| split_list(&origins));

        Self {
            port,
            models_dir,
            cache_dir,
            default_voice,
            preload_voices,
            rate_limit_per_minute,
            request_timeout_secs,
            cors_allowed_origins,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Unset falls back to the default; set but blank selects the in-memory cache.
fn cache_dir_setting(value: Option<String>, default: Option<PathBuf>) -> Option<PathBuf> {
    match value {
        None => default,
        Some(v) if v.trim().is_empty() => None,
        Some(v) => Some(PathBuf::from(v.trim())),
    }
}

/// Comma separated list, blanks dropped.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Piper's usual install location, `~/.local/share/piper/models`.
fn default_models_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/piper/models"),
        None => PathBuf::from("models"),
    }
}
