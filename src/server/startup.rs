use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::{ModelEngine, ServerConfig};
use crate::device::parse_device;
use crate::{AudioBuffer, PromptSource, Qwen3Tts, VoiceClonePrompt};

/// Load the model, prepare the voice prompt and warm up. Blocking.
///
/// Only a model load failure is an error; a missing or unusable reference
/// leaves the engine without a voice.
pub fn load_engine(config: &ServerConfig) -> Result<ModelEngine> {
    let device = parse_device(&config.device)?;
    let start = Instant::now();
    let model = Qwen3Tts::load(&config.model, config.tokenizer.as_deref(), device)
        .with_context(|| format!("Failed to load model {}", config.model))?;
    tracing::info!(
        model_type = %model.model_type(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "model loaded"
    );

    let model = Arc::new(Mutex::new(model));
    let prompt = {
        let guard = model.blocking_lock();
        let prompt = build_voice_prompt(&guard, config);
        if let (Some(prompt), true) = (&prompt, config.warmup) {
            if let Err(e) = guard.warmup(prompt) {
                tracing::warn!(error = %format!("{e:#}"), "warm-up failed");
            }
        }
        prompt
    };
    Ok(ModelEngine::new(model, prompt))
}

/// Restore the prompt from the cache or compute it from the reference clip.
pub fn build_voice_prompt(model: &Qwen3Tts, config: &ServerConfig) -> Option<VoiceClonePrompt> {
    if !model.supports_voice_cloning() {
        tracing::warn!(
            model_type = %model.model_type(),
            "voice cloning needs a Base checkpoint, voice cloning disabled"
        );
        return None;
    }
    if !config.ref_audio.is_file() {
        tracing::warn!(path = %config.ref_audio.display(), "reference audio not found, voice cloning disabled");
        return None;
    }
    let source = match PromptSource::describe(&config.model, &config.ref_audio, config.ref_text.as_deref()) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "reference audio unreadable, voice cloning disabled");
            return None;
        }
    };

    if let Some(cache) = &config.prompt_cache {
        if let Some(prompt) = restore_cached(cache, &source, model.hidden_size()) {
            return Some(prompt);
        }
    }

    let start = Instant::now();
    let built = AudioBuffer::load(&config.ref_audio)
        .and_then(|audio| model.create_voice_clone_prompt(&audio, source.ref_text.as_deref(), source.clone()));
    let prompt = match built {
        Ok(prompt) => prompt,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "failed to build voice prompt, voice cloning disabled");
            return None;
        }
    };
    tracing::info!(
        icl = prompt.is_icl(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "voice prompt ready"
    );

    if let Some(cache) = &config.prompt_cache {
        match prompt.save_cache(cache) {
            Ok(()) => tracing::debug!(path = %cache.display(), "voice prompt cached"),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "failed to write prompt cache"),
        }
    }
    Some(prompt)
}

/// A cached prompt, if it was built from `source` and fits the talker.
fn restore_cached(cache: &Path, source: &PromptSource, hidden_size: usize) -> Option<VoiceClonePrompt> {
    if !cache.exists() {
        return None;
    }
    let restored = VoiceClonePrompt::load_cache(cache, source).and_then(|prompt| {
        prompt.check_width(hidden_size)?;
        Ok(prompt)
    });
    match restored {
        Ok(prompt) => {
            tracing::info!(path = %cache.display(), icl = prompt.is_icl(), "voice prompt restored from cache");
            Some(prompt)
        }
        Err(e) => {
            tracing::info!(reason = %format!("{e:#}"), "stale prompt cache, rebuilding voice prompt");
            None
        }
    }
}
