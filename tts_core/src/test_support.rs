//! Test doubles for the backend, loader and store seams.

use std::f32::consts::PI;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{AudioStore, CacheKey, MemoryStore};
use crate::registry::{ModelAsset, ModelLoader, SpeechBackend};

/// Seconds of tone rendered per input character at `length_scale == 1`
pub const TONE_SECS_PER_CHAR: f32 = 0.05;

/// Deterministic sine tone whose length tracks the text length.
pub struct ToneBackend {
    pub sample_rate: u32,
    pub calls: Arc<AtomicUsize>,
}

impl SpeechBackend for ToneBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(&self, text: &str, length_scale: f32) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = (text.chars().count() as f32 * TONE_SECS_PER_CHAR * self.sample_rate as f32 * length_scale)
            .round() as usize;
        let step = 2.0 * PI * 440.0 / self.sample_rate as f32;
        Ok((0..n).map(|i| (i as f32 * step).sin() * 0.3).collect())
    }
}

/// Counts loads and backend calls; optionally slow to load.
pub struct CountingLoader {
    pub sample_rate: u32,
    pub loads: AtomicUsize,
    pub synth_calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl CountingLoader {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            loads: AtomicUsize::new(0),
            synth_calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

impl ModelLoader for CountingLoader {
    fn load(&self, _asset: &ModelAsset) -> anyhow::Result<Arc<dyn SpeechBackend>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(Arc::new(ToneBackend {
            sample_rate: self.sample_rate,
            calls: Arc::clone(&self.synth_calls),
        }))
    }
}

/// Counts load attempts, each of which fails after `delay`.
#[derive(Default)]
pub struct FailingLoader {
    pub loads: AtomicUsize,
    pub delay: Duration,
}

impl FailingLoader {
    pub fn with_delay_ms(ms: u64) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(ms),
        }
    }
}

impl ModelLoader for FailingLoader {
    fn load(&self, asset: &ModelAsset) -> anyhow::Result<Arc<dyn SpeechBackend>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        anyhow::bail!("corrupt model file {}", asset.model_path.display())
    }
}

struct FailingBackend;

impl SpeechBackend for FailingBackend {
    fn sample_rate(&self) -> u32 {
        22_050
    }

    fn synthesize(&self, _text: &str, _length_scale: f32) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("onnx session crashed")
    }
}

/// Loads fine, fails on every synthesis.
pub struct FailingBackendLoader;

impl ModelLoader for FailingBackendLoader {
    fn load(&self, _asset: &ModelAsset) -> anyhow::Result<Arc<dyn SpeechBackend>> {
        Ok(Arc::new(FailingBackend))
    }
}

/// Memory store that counts every operation.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    ops: AtomicUsize,
    fail_writes: bool,
}

impl CountingStore {
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn operations(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }
}

impl AudioStore for CountingStore {
    fn get(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only cache"));
        }
        self.inner.put(key, bytes)
    }

    fn contains(&self, key: &CacheKey) -> io::Result<bool> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.inner.contains(key)
    }
}

/// Temporary model directory with empty asset files for `voices`.
pub fn model_dir_with(voices: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create temp model dir");
    for voice in voices {
        std::fs::write(dir.path().join(format!("{voice}.onnx")), b"onnx").expect("write model");
        std::fs::write(dir.path().join(format!("{voice}.onnx.json")), b"{}").expect("write config");
    }
    dir
}
