//! HTTP surface: handlers, shared state and the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;
use tts_core::{SynthesisRequest, SynthesisResult, TtsManager};

use crate::error::ApiError;
use crate::metrics::{
    AppMetrics, DetailedMetricsResponse, EndpointMetricsResponse, SystemMetrics,
};

#[derive(Clone)]
pub struct AppState {
    pub tts: TtsManager,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub started: Instant,
}

impl AppState {
    pub fn new(tts: TtsManager) -> Self {
        Self {
            tts,
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }
}

/// Body of `POST /synthesize`. The voice may be given as `model`,
/// `voice_id` or `voiceId`.
#[derive(Debug, Deserialize)]
pub struct SynthesizeBody {
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "voice_id", alias = "voiceId")]
    pub model: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default, alias = "useCache")]
    pub use_cache: Option<bool>,
}

impl SynthesizeBody {
    fn into_request(self, default_voice: &str) -> SynthesisRequest {
        let voice = self
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_voice.to_string());
        SynthesisRequest::new(self.text, voice)
            .with_speed(self.speed.unwrap_or(1.0))
            .with_cache(self.use_cache.unwrap_or(true))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SynthesizeResponse {
    /// WAV file, hex encoded
    pub audio: String,
    pub duration_sec: f64,
    pub model: String,
    pub cached: bool,
    pub sample_rate: u32,
}

impl From<SynthesisResult> for SynthesizeResponse {
    fn from(result: SynthesisResult) -> Self {
        Self {
            audio: hex::encode(&result.audio),
            duration_sec: round_2dp(result.duration_secs),
            model: result.voice_id,
            cached: result.cached,
            sample_rate: result.sample_rate,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub loaded_models: usize,
    pub uptime_seconds: u64,
}

fn round_2dp(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Validate, synthesize and record metrics for one request.
async fn run_synthesis(
    state: &AppState,
    payload: Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<SynthesisResult, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let outcome = match payload {
        Ok(Json(body)) => {
            let request = body.into_request(state.tts.default_voice());
            state.tts.synthesize(request).await.map_err(ApiError::from)
        }
        Err(rejection) => Err(ApiError::InvalidInput(rejection.body_text())),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let endpoint = &state.metrics.synthesize;
    endpoint.record_request(elapsed_ms);
    match &outcome {
        Ok(result) => {
            state
                .metrics
                .tts
                .record_synthesis(elapsed_ms, result.duration_secs, result.cached)
        }
        Err(_) => endpoint.record_error(),
    }
    outcome
}

pub async fn synthesize(
    State(state): State<AppState>,
    payload: Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<Json<SynthesizeResponse>, ApiError> {
    let result = run_synthesis(&state, payload).await?;
    Ok(Json(result.into()))
}

/// Same as [`synthesize`] but answers with the WAV bytes themselves.
pub async fn synthesize_wav(
    State(state): State<AppState>,
    payload: Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let result = run_synthesis(&state, payload).await?;
    let headers = [
        (header::CONTENT_TYPE, "audio/wav".to_string()),
        (
            HeaderName::from_static("x-duration-sec"),
            format!("{:.2}", result.duration_secs),
        ),
        (HeaderName::from_static("x-cached"), result.cached.to_string()),
        (HeaderName::from_static("x-voice-id"), result.voice_id.clone()),
    ];
    Ok((headers, result.audio).into_response())
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.tts.available_voices(),
    })
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        loaded_models: state.tts.loaded_models(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let system = SystemMetrics::collect(
        state.request_count.load(Ordering::Relaxed),
        state.started.elapsed().as_secs(),
    );
    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system,
        endpoints: EndpointMetricsResponse {
            synthesize: state.metrics.synthesize.stats(),
        },
        tts: state
            .metrics
            .tts
            .snapshot(state.tts.loaded_models(), state.tts.cache().in_flight()),
    })
}

/// Tag request and response with a fresh `x-request-id`.
pub async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert("x-request-id", value.clone());
    }
    debug!(%request_id, method = %request.method(), uri = %request.uri(), "Incoming request");

    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// All routes, served both at the root and under `/api`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/models", get(list_models))
        .route("/synthesize", post(synthesize))
        .route("/synthesize/wav", post(synthesize_wav))
        .route("/metrics", get(metrics_endpoint));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_aliases_and_defaults() {
        let body: SynthesizeBody =
            serde_json::from_str(r#"{"text": "Hi", "voiceId": "v2", "useCache": false}"#).unwrap();
        let req = body.into_request("v1");
        assert_eq!(req.voice_id, "v2");
        assert!(!req.use_cache);
        assert_eq!(req.speed, 1.0);

        let body: SynthesizeBody = serde_json::from_str(r#"{"text": "Hi"}"#).unwrap();
        let req = body.into_request("v1");
        assert_eq!(req.voice_id, "v1");
        assert!(req.use_cache);

        let body: SynthesizeBody =
            serde_json::from_str(r#"{"text": "Hi", "model": " ", "speed": 1.5}"#).unwrap();
        let req = body.into_request("v1");
        assert_eq!(req.voice_id, "v1");
        assert_eq!(req.speed, 1.5);
    }

    #[test]
    fn test_duration_rounding() {
        assert_eq!(round_2dp(1.23456), 1.23);
        assert_eq!(round_2dp(0.499), 0.5);
        assert_eq!(round_2dp(2.0), 2.0);
    }
}
