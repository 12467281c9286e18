//! Piper (ONNX VITS) backend.

use std::{fs, path::Path, sync::{Arc, Mutex}};

use anyhow::Context;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};
use piper_rs::PiperSynthesisConfig;

use crate::registry::{ModelAsset, ModelLoader, SpeechBackend};

/// Loads `<voice>.onnx.json` configs through piper-rs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PiperLoader;

impl ModelLoader for PiperLoader {
    fn load(&self, asset: &ModelAsset) -> anyhow::Result<Arc<dyn SpeechBackend>> {
        let sample_rate = read_sample_rate(&asset.config_path)?;
        let model = piper_rs::from_config_path(&asset.config_path)
            .map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;

        // the voice's own inference settings; speed scales its length_scale
        let base = model
            .get_fallback_synthesis_config()
            .map_err(|e| anyhow::anyhow!("piper config error: {e}"))?
            .downcast::<PiperSynthesisConfig>()
            .map_err(|_| anyhow::anyhow!("unexpected piper synthesis config type"))?;

        let handle = Arc::clone(&model);
        let apply_length_scale = move |length_scale: f32| -> anyhow::Result<()> {
            handle
                .set_fallback_synthesis_config(&scaled_config(&base, length_scale))
                .map_err(|e| anyhow::anyhow!("piper config error: {e}"))
        };

        let synth = PiperSpeechSynthesizer::new(model)
            .map_err(|e| anyhow::anyhow!("piper synthesizer error: {e}"))?;

        Ok(Arc::new(PiperBackend {
            synth: Mutex::new(synth),
            apply_length_scale: Box::new(apply_length_scale),
            sample_rate,
        }))
    }
}

pub struct PiperBackend {
    // one inference at a time per voice; the length scale is set under this lock
    synth: Mutex<PiperSpeechSynthesizer>,
    apply_length_scale: Box<dyn Fn(f32) -> anyhow::Result<()> + Send + Sync>,
    sample_rate: u32,
}

/// `base` with its length scale multiplied by `length_scale`.
fn scaled_config(base: &PiperSynthesisConfig, length_scale: f32) -> PiperSynthesisConfig {
    PiperSynthesisConfig {
        length_scale: base.length_scale * length_scale,
        ..base.clone()
    }
}

impl SpeechBackend for PiperBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(&self, text: &str, length_scale: f32) -> anyhow::Result<Vec<f32>> {
        let synth = self
            .synth
            .lock()
            .map_err(|_| anyhow::anyhow!("Synthesizer lock poisoned by an earlier panic"))?;
        (self.apply_length_scale)(length_scale)?;

        let iter: PiperSpeechStreamParallel = synth
            .synthesize_parallel(text.to_string(), None)
            .map_err(|e| anyhow::anyhow!("piper synth error: {e}"))?;

        let mut samples: Vec<f32> = Vec::new();
        for part in iter {
            samples.extend(
                part.map_err(|e| anyhow::anyhow!("chunk error: {e}"))?
                    .into_vec(),
            );
        }
        Ok(samples)
    }
}

/// Read `audio.sample_rate` from a Piper model config.
fn read_sample_rate(cfg_path: &Path) -> anyhow::Result<u32> {
    let text = fs::read_to_string(cfg_path)
        .with_context(|| format!("Failed to read config file: {}", cfg_path.display()))?;
    parse_sample_rate(&text)
}

fn parse_sample_rate(config_json: &str) -> anyhow::Result<u32> {
    let json: serde_json::Value =
        serde_json::from_str(config_json).context("Config file is not valid JSON")?;
    let sample_rate = json
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .filter(|&sr| sr > 0 && sr <= u32::MAX as u64)
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;
    Ok(sample_rate as u32)
}
