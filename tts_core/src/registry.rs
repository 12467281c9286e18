//! Voice model registry: resolves voice ids to loaded backends, lazily.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, TtsError};
use crate::request::is_valid_voice_id;

/// Model file extension in the model directory
const MODEL_EXTENSION: &str = "onnx";

/// A text-to-samples backend bound to one voice. Must be safe for concurrent use.
pub trait SpeechBackend: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Render text to mono f32 samples. `length_scale > 1` produces longer audio.
    fn synthesize(&self, text: &str, length_scale: f32) -> anyhow::Result<Vec<f32>>;
}

/// Builds a backend from located model assets. Called at most once per voice
/// at a time.
pub trait ModelLoader: Send + Sync {
    fn load(&self, asset: &ModelAsset) -> anyhow::Result<Arc<dyn SpeechBackend>>;
}

/// Files backing a voice: `<dir>/<voice>.onnx` and its `<voice>.onnx.json` config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub voice_id: String,
    pub model_path: PathBuf,
    pub config_path: PathBuf,
}

pub struct VoiceModel {
    voice_id: String,
    asset: ModelAsset,
    backend: Arc<dyn SpeechBackend>,
}

impl VoiceModel {
    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn asset(&self) -> &ModelAsset {
        &self.asset
    }

    pub fn sample_rate(&self) -> u32 {
        self.backend.sample_rate()
    }

    pub fn backend(&self) -> &dyn SpeechBackend {
        self.backend.as_ref()
    }
}

// Manual Debug implementation since backends are trait objects
impl std::fmt::Debug for VoiceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceModel")
            .field("voice_id", &self.voice_id)
            .field("asset", &self.asset)
            .field("backend", &"<SpeechBackend>")
            .field("sample_rate", &self.backend.sample_rate())
            .finish()
    }
}

/// Outcome of one load attempt; the error is the rendered cause.
type LoadOutcome = std::result::Result<Arc<VoiceModel>, String>;

enum ModelSlot {
    Ready(Arc<VoiceModel>),
    // every caller that finds the slot loading observes this attempt's outcome
    Loading(watch::Receiver<Option<LoadOutcome>>),
}

/// Loaded models live for the lifetime of the registry; there is no unload path.
#[derive(Clone)]
pub struct VoiceModelRegistry {
    models_dir: Arc<PathBuf>,
    loader: Arc<dyn ModelLoader>,
    // voice id -> loaded model or the load in progress; failed loads leave no slot
    slots: Arc<DashMap<String, ModelSlot>>,
}

impl VoiceModelRegistry {
    pub fn new(models_dir: impl Into<PathBuf>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            models_dir: Arc::new(models_dir.into()),
            loader,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Resolve a voice id to its loaded model, loading it on first use.
    ///
    /// Concurrent first callers for the same voice share a single load attempt
    /// and all observe its outcome. A failed attempt is not retried for them;
    /// the slot is cleared so a later call starts a fresh one. A missing asset
    /// yields `ModelNotFound` without registering anything.
    pub async fn resolve(&self, voice_id: &str) -> Result<Arc<VoiceModel>> {
        if let Some(model) = self.loaded(voice_id) {
            return Ok(model);
        }

        let asset = self.locate(voice_id)?;
        let mut outcome = match self.slots.entry(voice_id.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                ModelSlot::Ready(model) => return Ok(Arc::clone(model)),
                ModelSlot::Loading(rx) => rx.clone(),
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(ModelSlot::Loading(rx.clone()));
                self.spawn_load(asset, tx);
                rx
            }
        };

        let published = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .ok()
            .flatten();
        match published {
            Some(Ok(model)) => Ok(model),
            Some(Err(cause)) => Err(TtsError::ModelLoad {
                voice_id: voice_id.to_string(),
                source: anyhow::anyhow!(cause),
            }),
            None => Err(TtsError::ModelLoad {
                voice_id: voice_id.to_string(),
                source: anyhow::anyhow!("load task ended without a result"),
            }),
        }
    }

    /// Run one load attempt on its own task, so it completes even if every
    /// caller waiting on it goes away. The slot is updated before the outcome
    /// is published.
    fn spawn_load(&self, asset: ModelAsset, tx: watch::Sender<Option<LoadOutcome>>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let voice_id = asset.voice_id.clone();
            let outcome = match registry.load(asset).await {
                Ok(model) => {
                    registry
                        .slots
                        .insert(voice_id, ModelSlot::Ready(Arc::clone(&model)));
                    Ok(model)
                }
                Err(e) => {
                    warn!(voice = %voice_id, "Failed to load voice model: {e:#}");
                    registry.slots.remove(&voice_id);
                    Err(format!("{e:#}"))
                }
            };
            tx.send_replace(Some(outcome));
        });
    }

    /// Already-loaded model for a voice, without touching the filesystem.
    pub fn loaded(&self, voice_id: &str) -> Option<Arc<VoiceModel>> {
        self.slots.get(voice_id).and_then(|slot| match slot.value() {
            ModelSlot::Ready(model) => Some(Arc::clone(model)),
            ModelSlot::Loading(_) => None,
        })
    }

    /// Number of models constructed so far.
    pub fn loaded_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), ModelSlot::Ready(_)))
            .count()
    }

    /// Map a voice id to its asset files. Ids outside the path-safe alphabet
    /// are rejected as `InvalidRequest`, as in request validation.
    pub fn locate(&self, voice_id: &str) -> Result<ModelAsset> {
        if !is_valid_voice_id(voice_id) {
            return Err(TtsError::InvalidRequest(format!("Invalid voice id: '{voice_id}'")));
        }
        let model_path = self
            .models_dir
            .join(format!("{voice_id}.{MODEL_EXTENSION}"));
        if !model_path.is_file() {
            return Err(TtsError::ModelNotFound(format!(
                "{voice_id} (no model at {})",
                model_path.display()
            )));
        }
        let config_path = self
            .models_dir
            .join(format!("{voice_id}.{MODEL_EXTENSION}.json"));
        Ok(ModelAsset {
            voice_id: voice_id.to_string(),
            model_path,
            config_path,
        })
    }

    /// Voice ids with a model file in the model directory, sorted. Listing
    /// does not load anything.
    pub fn available_voices(&self) -> Vec<String> {
        let entries = match fs::read_dir(self.models_dir.as_path()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.models_dir.display(), "Cannot read model directory: {e}");
                return Vec::new();
            }
        };

        let mut voices: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(MODEL_EXTENSION)
            })
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .filter(|voice_id| is_valid_voice_id(voice_id))
            .collect();
        voices.sort();
        voices
    }

    /// Load frequently used voices up front. Failures are logged and skipped.
    pub async fn preload(&self, voice_ids: &[String]) -> usize {
        let mut loaded = 0;
        for voice_id in voice_ids {
            match self.resolve(voice_id).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(voice = %voice_id, "Preload failed: {e}"),
            }
        }
        loaded
    }

    async fn load(&self, asset: ModelAsset) -> anyhow::Result<Arc<VoiceModel>> {
        let started = Instant::now();
        let loader = Arc::clone(&self.loader);
        let task_asset = asset.clone();

        let backend = tokio::task::spawn_blocking(move || loader.load(&task_asset))
            .await
            .map_err(|e| anyhow::anyhow!("load task failed: {e}"))??;

        info!(
            voice = %asset.voice_id,
            sample_rate = backend.sample_rate(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded voice model"
        );
        Ok(Arc::new(VoiceModel {
            voice_id: asset.voice_id.clone(),
            asset,
            backend,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingLoader, FailingLoader};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn touch_model(dir: &Path, voice_id: &str) {
        fs::write(dir.join(format!("{voice_id}.onnx")), b"onnx").unwrap();
        fs::write(dir.join(format!("{voice_id}.onnx.json")), b"{}").unwrap();
    }

    #[tokio::test]
    async fn resolve_reuses_loaded_model() {
        let temp = tempdir().unwrap();
        touch_model(temp.path(), "v1");
        let loader = Arc::new(CountingLoader::new(22_050));
        let registry = VoiceModelRegistry::new(temp.path(), loader.clone());

        let first = registry.resolve("v1").await.unwrap();
        let second = registry.resolve("v1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded_count(), 1);
        assert_eq!(first.voice_id(), "v1");
        assert_eq!(first.sample_rate(), 22_050);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolve_loads_once() {
        let temp = tempdir().unwrap();
        touch_model(temp.path(), "v1");
        let loader = Arc::new(CountingLoader::new(22_050).with_delay_ms(100));
        let registry = VoiceModelRegistry::new(temp.path(), loader.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("v1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_asset_is_model_not_found() {
        let temp = tempdir().unwrap();
        let loader = Arc::new(CountingLoader::new(22_050));
        let registry = VoiceModelRegistry::new(temp.path(), loader.clone());

        let err = registry.resolve("does-not-exist").await.unwrap_err();
        assert!(matches!(err, TtsError::ModelNotFound(_)));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert_eq!(registry.loaded_count(), 0);
    }

    #[tokio::test]
    async fn traversal_ids_are_invalid_requests() {
        let temp = tempdir().unwrap();
        let registry = VoiceModelRegistry::new(temp.path(), Arc::new(CountingLoader::new(22_050)));
        for voice_id in ["../v1", "voices/v1", ""] {
            let err = registry.resolve(voice_id).await.unwrap_err();
            assert!(matches!(err, TtsError::InvalidRequest(_)), "{voice_id}: {err}");
            assert!(err.is_client_error());
        }
        assert!(matches!(registry.locate("../v1"), Err(TtsError::InvalidRequest(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_failed_load() {
        let temp = tempdir().unwrap();
        touch_model(temp.path(), "v1");
        let loader = Arc::new(FailingLoader::with_delay_ms(100));
        let registry = VoiceModelRegistry::new(temp.path(), loader.clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("v1").await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, TtsError::ModelLoad { ref voice_id, .. } if voice_id == "v1"));
            assert!(err.to_string().contains("corrupt model file"));
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded_count(), 0);

        // a later call starts a fresh attempt
        assert!(registry.resolve("v1").await.is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn load_failure_does_not_poison_other_voices() {
        let temp = tempdir().unwrap();
        touch_model(temp.path(), "broken");
        let registry = VoiceModelRegistry::new(temp.path(), Arc::new(FailingLoader::default()));

        let err = registry.resolve("broken").await.unwrap_err();
        assert!(matches!(err, TtsError::ModelLoad { ref voice_id, .. } if voice_id == "broken"));
        assert_eq!(registry.loaded_count(), 0);

        let good_dir = tempdir().unwrap();
        touch_model(good_dir.path(), "v1");
        let registry = VoiceModelRegistry::new(good_dir.path(), Arc::new(CountingLoader::new(16_000)));
        assert!(registry.resolve("v1").await.is_ok());
    }

    #[test]
    fn available_voices_lists_model_files() {
        let temp = tempdir().unwrap();
        touch_model(temp.path(), "en_US-lessac-medium");
        touch_model(temp.path(), "de_DE-thorsten-high");
        fs::write(temp.path().join("README.md"), b"notes").unwrap();
        let registry = VoiceModelRegistry::new(temp.path(), Arc::new(CountingLoader::new(22_050)));

        assert_eq!(
            registry.available_voices(),
            vec!["de_DE-thorsten-high".to_string(), "en_US-lessac-medium".to_string()]
        );
        assert_eq!(registry.loaded_count(), 0);
    }

    #[test]
    fn available_voices_of_missing_dir_is_empty() {
        let registry = VoiceModelRegistry::new(
            "/nonexistent/piper/models",
            Arc::new(CountingLoader::new(22_050)),
        );
        assert!(registry.available_voices().is_empty());
    }

    #[tokio::test]
    async fn preload_skips_unknown_voices() {
        let temp = tempdir().unwrap();
        touch_model(temp.path(), "v1");
        let registry = VoiceModelRegistry::new(temp.path(), Arc::new(CountingLoader::new(22_050)));

        let loaded = registry
            .preload(&["v1".to_string(), "missing".to_string()])
            .await;
        assert_eq!(loaded, 1);
        assert!(registry.loaded("v1").is_some());
    }
}
