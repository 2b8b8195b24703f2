//! The seam between HTTP handlers and the model.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{AudioBuffer, Language, Qwen3Tts, SynthesisOptions, VoiceClonePrompt};

/// A validated synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: Language,
    pub seed: u64,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no voice prompt loaded")]
    NoVoice,
    #[error("{0:#}")]
    Engine(anyhow::Error),
    #[error("synthesis task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Whether a cloned voice is available.
    fn has_voice(&self) -> bool;

    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioBuffer, SynthesisError>;
}

/// Loaded model plus the voice prompt built at startup.
pub struct ModelEngine {
    model: Arc<Mutex<Qwen3Tts>>,
    prompt: Option<Arc<VoiceClonePrompt>>,
}

impl ModelEngine {
    pub fn new(model: Arc<Mutex<Qwen3Tts>>, prompt: Option<VoiceClonePrompt>) -> Self {
        Self {
            model,
            prompt: prompt.map(Arc::new),
        }
    }
}

#[async_trait]
impl Synthesizer for ModelEngine {
    fn has_voice(&self) -> bool {
        self.prompt.is_some()
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioBuffer, SynthesisError> {
        let prompt = self.prompt.clone().ok_or(SynthesisError::NoVoice)?;
        let model = Arc::clone(&self.model);
        let options = SynthesisOptions {
            seed: Some(request.seed),
            ..Default::default()
        };

        tokio::task::spawn_blocking(move || {
            let model = model.blocking_lock();
            let start = std::time::Instant::now();
            let audio = model.synthesize_voice_clone(&request.text, &prompt, request.language, Some(options))?;
            tracing::info!(
                chars = request.text.chars().count(),
                seconds = audio.duration(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "synthesized"
            );
            Ok::<_, anyhow::Error>(audio)
        })
        .await?
        .map_err(SynthesisError::Engine)
    }
}
