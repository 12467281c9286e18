//! Common utilities for integration tests

#![allow(dead_code)]

use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use server::{router, AppState};
use tempfile::TempDir;
use tower::ServiceExt;
use tts_core::{
    FsStore, ModelAsset, ModelLoader, SpeechBackend, SynthesisCache, SynthesisEngine, TtsManager,
    VoiceModelRegistry,
};

pub const SAMPLE_RATE: u32 = 22_050;

/// Sine tone, 50 ms per character.
struct ToneBackend {
    calls: Arc<AtomicUsize>,
}

impl SpeechBackend for ToneBackend {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn synthesize(&self, text: &str, length_scale: f32) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = (text.chars().count() as f32 * 0.05 * SAMPLE_RATE as f32 * length_scale).round() as usize;
        let step = 2.0 * PI * 440.0 / SAMPLE_RATE as f32;
        Ok((0..n).map(|i| (i as f32 * step).sin() * 0.3).collect())
    }
}

#[derive(Default)]
pub struct ToneLoader {
    pub loads: AtomicUsize,
    pub synth_calls: Arc<AtomicUsize>,
}

impl ModelLoader for ToneLoader {
    fn load(&self, _asset: &ModelAsset) -> anyhow::Result<Arc<dyn SpeechBackend>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ToneBackend {
            calls: Arc::clone(&self.synth_calls),
        }))
    }
}

pub struct TestApp {
    pub app: Router,
    pub loader: Arc<ToneLoader>,
    pub models_dir: TempDir,
    pub cache_dir: TempDir,
}

impl TestApp {
    pub fn loads(&self) -> usize {
        self.loader.loads.load(Ordering::SeqCst)
    }

    pub fn synth_calls(&self) -> usize {
        self.loader.synth_calls.load(Ordering::SeqCst)
    }

    /// Number of `.wav` entries persisted in the cache dir.
    pub fn cache_entries(&self) -> usize {
        std::fs::read_dir(self.cache_dir.path())
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "wav"))
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(self.app.clone(), request).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        self.post_raw(uri, body.to_string()).await
    }

    pub async fn post_raw(&self, uri: &str, body: impl Into<Body>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        send(self.app.clone(), request).await
    }
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

/// App over a temp model dir holding `voices` (the first is the default)
/// and an empty temp cache dir.
pub fn create_test_app(voices: &[&str]) -> TestApp {
    let models_dir = tempfile::tempdir().unwrap();
    for voice in voices {
        std::fs::write(models_dir.path().join(format!("{voice}.onnx")), b"onnx").unwrap();
        std::fs::write(models_dir.path().join(format!("{voice}.onnx.json")), b"{}").unwrap();
    }
    let cache_dir = tempfile::tempdir().unwrap();

    let loader = Arc::new(ToneLoader::default());
    let tts = TtsManager::new(
        VoiceModelRegistry::new(models_dir.path(), loader.clone()),
        SynthesisEngine::new(),
        SynthesisCache::new(Arc::new(FsStore::open(cache_dir.path()).unwrap())),
        voices.first().copied().unwrap_or("en_US-lessac-medium"),
    );

    TestApp {
        app: router(AppState::new(tts)),
        loader,
        models_dir,
        cache_dir,
    }
}
