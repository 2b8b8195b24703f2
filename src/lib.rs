//! # monitalk-tts
//!
//! Qwen3-TTS (12 Hz) inference on candle, plus the small HTTP service that
//! serves a single cloned companion voice.
//!
//! ## Pipeline
//!
//! 1. **Talker**: a Qwen3 decoder that predicts the semantic (first) codebook
//!    of each 12.5 Hz frame from fused text + codec embeddings.
//! 2. **Code predictor**: a 5-layer transformer filling in the 15 acoustic
//!    codebooks of every frame.
//! 3. **Decoder12Hz**: turns 16-codebook frames into 24 kHz mono audio,
//!    1920 samples per frame.
//!
//! Voice cloning conditions the talker on an ECAPA-TDNN x-vector of a
//! reference clip and, when the speech encoder is available, on the clip's
//! own codec frames and transcript (in-context cloning). VoiceDesign
//! checkpoints are conditioned on a natural-language description instead.
//!
//! ```rust,ignore
//! use monitalk_tts::{AudioBuffer, Language, PromptSource, Qwen3Tts};
//!
//! let device = monitalk_tts::device::parse_device("auto")?;
//! let tts = Qwen3Tts::load("Qwen/Qwen3-TTS-12Hz-1.7B-Base", None, device)?;
//! let reference = AudioBuffer::load("voices/monika.mp3")?;
//! let prompt = tts.create_voice_clone_prompt(&reference, Some("Hi!"), source)?;
//! let audio = tts.synthesize_voice_clone("Hello.", &prompt, Language::English, None)?;
//! audio.save("hello.wav")?;
//! ```

pub mod audio;
pub mod device;
pub mod generation;
pub mod hub;
pub mod logging;
pub mod models;
pub mod prompt;
pub mod server;
pub mod tokenizer;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::time::Instant;

use generation::{logits_row, sample_row, GenerationConfig, LogitProcessor, SamplingContext};
use models::codec::{Decoder12Hz, Decoder12HzConfig, Encoder12Hz};
use models::weights::strip_prefix;

pub use audio::AudioBuffer;
pub use models::talker::{codec_tokens, special_tokens, tts_tokens, Language};
pub use models::{CodePredictor, ModelConfig, ModelType, SpeakerEncoder, TalkerModel};
pub use prompt::{PromptSource, VoiceClonePrompt};
pub use tokenizer::TextTokenizer;

/// `[T][16]` codec frames: one semantic code followed by 15 acoustic codes.
pub type FrameCodes = Vec<Vec<u32>>;

pub const CODEC_EOS_TOKEN_ID: u32 = codec_tokens::CODEC_EOS;

/// Per-call sampling parameters.
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Upper bound on generated frames
    pub max_length: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    /// 1.0 disables
    pub repetition_penalty: f64,
    pub eos_token_id: Option<u32>,
    pub min_new_tokens: usize,
    /// Fixed seed for reproducible output; `None` draws from entropy
    pub seed: Option<u64>,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            max_length: 2048,
            temperature: 0.9,
            top_k: 50,
            top_p: 0.9,
            repetition_penalty: 1.05,
            eos_token_id: Some(CODEC_EOS_TOKEN_ID),
            min_new_tokens: 2,
            seed: None,
        }
    }
}

impl SynthesisOptions {
    pub fn to_gen_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_length,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            eos_token_id: self.eos_token_id,
            min_new_tokens: self.min_new_tokens,
        }
    }

    /// In-context cloning tends to loop, so it runs with a stronger
    /// repetition penalty and a length cap tied to the target text.
    pub fn for_icl(&self, text_tokens: usize) -> Self {
        Self {
            repetition_penalty: self.repetition_penalty.max(1.5),
            max_length: self.max_length.min((text_tokens * 6).max(75)),
            ..self.clone()
        }
    }
}

/// Drop the part of an ICL waveform that belongs to the prepended
/// reference frames, proportionally to frame counts.
fn trim_reference(mut samples: Vec<f32>, ref_frames: usize, total_frames: usize) -> Vec<f32> {
    if total_frames == 0 {
        return samples;
    }
    let cut = (ref_frames * samples.len() / total_frames).min(samples.len());
    samples.drain(..cut);
    samples
}

/// Loaded model: talker, code predictor, codec and (for Base checkpoints)
/// the speaker and speech encoders.
pub struct Qwen3Tts {
    talker: TalkerModel,
    code_predictor: CodePredictor,
    decoder: Decoder12Hz,
    speaker_encoder: Option<SpeakerEncoder>,
    speech_encoder: Option<Encoder12Hz>,
    tokenizer: TextTokenizer,
    config: ModelConfig,
    device: Device,
}

impl Qwen3Tts {
    /// Load from a local checkpoint directory or hub id.
    ///
    /// `tokenizer` overrides where the text tokenizer comes from; by default
    /// it is read from the checkpoint directory.
    pub fn load(model: &str, tokenizer: Option<&str>, device: Device) -> Result<Self> {
        let root = hub::resolve_model_dir(model)?;
        let paths = hub::ModelPaths::from_dir(&root)?;
        let config = ModelConfig::from_file(&paths.config)?;
        tracing::info!(
            model,
            variant = %config.label(),
            device = %device::device_info(&device),
            "loading model"
        );

        let tokenizer = match tokenizer {
            Some(source) => TextTokenizer::from_pretrained(source)?,
            None => TextTokenizer::from_dir(&root)?,
        };
        let weights = candle_core::safetensors::load(&paths.weights, &device)
            .with_context(|| format!("Failed to load {}", paths.weights.display()))?;
        let speech = candle_core::safetensors::load(&paths.speech_weights, &device)
            .with_context(|| format!("Failed to load {}", paths.speech_weights.display()))?;

        Self::from_weights(config, weights, speech, tokenizer, device)
    }

    /// Assemble from already loaded tensors.
    pub fn from_weights(
        config: ModelConfig,
        weights: HashMap<String, Tensor>,
        speech: HashMap<String, Tensor>,
        tokenizer: TextTokenizer,
        device: Device,
    ) -> Result<Self> {
        let start = Instant::now();
        let dtype = device::compute_dtype(&device);

        let speaker_encoder = if weights.keys().any(|k| k.starts_with("speaker_encoder.")) {
            let se_config = config.speaker_encoder_config.clone().unwrap_or_default();
            let vb = VarBuilder::from_tensors(strip_prefix(&weights, "speaker_encoder."), DType::F32, &device);
            Some(SpeakerEncoder::new(&se_config, vb).context("Failed to build speaker encoder")?)
        } else {
            None
        };

        let vb = VarBuilder::from_tensors(weights, dtype, &device);
        let talker = TalkerModel::new(config.talker_config.clone(), vb.clone())
            .context("Failed to build talker")?;
        let code_predictor = CodePredictor::new(
            &config.talker_config.code_predictor_config,
            config.talker_config.hidden_size,
            vb,
        )
        .context("Failed to build code predictor")?;

        let speech_encoder = if Encoder12Hz::is_present(&speech) {
            match Encoder12Hz::from_weights(&speech, &device) {
                Ok(encoder) => Some(encoder),
                Err(e) => {
                    tracing::warn!(error = %e, "speech encoder unavailable, in-context cloning disabled");
                    None
                }
            }
        } else {
            None
        };
        let decoder = Decoder12Hz::from_weights(speech, Decoder12HzConfig::default(), &device)
            .context("Failed to build codec decoder")?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            speaker_encoder = speaker_encoder.is_some(),
            speech_encoder = speech_encoder.is_some(),
            "model ready"
        );
        Ok(Self {
            talker,
            code_predictor,
            decoder,
            speaker_encoder,
            speech_encoder,
            tokenizer,
            config,
            device,
        })
    }

    pub fn model_type(&self) -> ModelType {
        self.config.tts_model_type
    }

    /// Only Base checkpoints carry the speaker encoder.
    pub fn supports_voice_cloning(&self) -> bool {
        self.speaker_encoder.is_some()
    }

    /// Width of the talker, and so of a usable speaker embedding.
    pub fn hidden_size(&self) -> usize {
        self.config.talker_config.hidden_size
    }

    /// Embed a reference clip once so every request can reuse it.
    ///
    /// With a transcript and a speech encoder the prompt carries the clip's
    /// codec frames for in-context cloning; otherwise it is x-vector only.
    pub fn create_voice_clone_prompt(
        &self,
        reference: &AudioBuffer,
        ref_text: Option<&str>,
        source: PromptSource,
    ) -> Result<VoiceClonePrompt> {
        let Some(encoder) = self.speaker_encoder.as_ref() else {
            bail!(
                "{} checkpoint has no speaker encoder; voice cloning needs a Base model",
                self.config.label()
            );
        };
        if reference.is_empty() {
            bail!("reference audio is empty");
        }
        let reference = if reference.sample_rate != audio::SAMPLE_RATE {
            tracing::debug!(from = reference.sample_rate, "resampling reference to 24 kHz");
            audio::resample_to_24k(reference)?
        } else {
            reference.clone()
        };

        let speaker_embedding: Vec<f32> = encoder
            .encode(&reference.samples)?
            .to_dtype(DType::F32)?
            .to_vec1()?;

        let ref_text = ref_text.map(str::trim).filter(|t| !t.is_empty());
        let (ref_codes, ref_text_ids) = match (ref_text, self.speech_encoder.as_ref()) {
            (Some(text), Some(speech)) => {
                let codes = speech.encode(&reference.samples)?;
                tracing::debug!(frames = codes.len(), "encoded reference codes");
                (Some(codes), Some(self.tokenizer.encode(text)?))
            }
            (Some(_), None) => {
                tracing::warn!("no speech encoder; falling back to x-vector cloning");
                (None, None)
            }
            (None, _) => (None, None),
        };

        Ok(VoiceClonePrompt {
            source,
            speaker_embedding,
            ref_codes,
            ref_text_ids,
        })
    }

    /// Speak `text` in the voice captured by `prompt`.
    pub fn synthesize_voice_clone(
        &self,
        text: &str,
        prompt: &VoiceClonePrompt,
        language: Language,
        options: Option<SynthesisOptions>,
    ) -> Result<AudioBuffer> {
        let options = options.unwrap_or_default();
        let ids = self.encode_target(text)?;
        let speaker = prompt.speaker_tensor(&self.device)?;

        let icl = match (&prompt.ref_codes, &prompt.ref_text_ids) {
            (Some(codes), Some(ref_ids)) if prompt.is_icl() => Some((codes, ref_ids)),
            _ => None,
        };
        let prefix = self
            .talker
            .voice_clone_prefix(&ids, &speaker, language, icl.is_some())?;

        let Some((ref_codes, ref_ids)) = icl else {
            let trailing = self.talker.trailing_text(&ids)?;
            let frames = self.generate_frames(&prefix, &trailing, &options)?;
            return self.decode_codes(&frames);
        };

        let ref_embeds = self.reference_codec_embeds(ref_codes)?;
        let (block, trailing) = self.talker.icl_block(&ids, ref_ids, &ref_embeds)?;
        let prefill = Tensor::cat(&[&prefix, &block], 1)?;
        let frames = self.generate_frames(&prefill, &trailing, &options.for_icl(ids.len()))?;

        let total = ref_codes.len() + frames.len();
        let mut all = ref_codes.clone();
        all.extend(frames);
        let samples = self.decoder.decode(&all)?;
        Ok(AudioBuffer::new(
            trim_reference(samples, ref_codes.len(), total),
            audio::SAMPLE_RATE,
        ))
    }

    /// Speak `text` in a voice described by `instruct` (VoiceDesign models).
    pub fn synthesize_voice_design(
        &self,
        text: &str,
        instruct: &str,
        language: Language,
        options: Option<SynthesisOptions>,
    ) -> Result<AudioBuffer> {
        if self.model_type() != ModelType::VoiceDesign {
            tracing::warn!(model = %self.model_type(), "voice design on a non-VoiceDesign checkpoint");
        }
        let options = options.unwrap_or_default();
        let ids = self.encode_target(text)?;
        let instruct_ids = self.tokenizer.encode_instruct(instruct)?;
        let prefix = self.talker.voice_design_prefix(&ids, &instruct_ids, language)?;
        let trailing = self.talker.trailing_text(&ids)?;
        let frames = self.generate_frames(&prefix, &trailing, &options)?;
        self.decode_codes(&frames)
    }

    /// Short clone pass so the first real request skips kernel warm-up.
    pub fn warmup(&self, prompt: &VoiceClonePrompt) -> Result<()> {
        let start = Instant::now();
        let options = SynthesisOptions {
            seed: Some(0),
            ..Default::default()
        };
        let audio = self.synthesize_voice_clone("Hello.", prompt, Language::English, Some(options))?;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            seconds = audio.duration(),
            "warm-up complete"
        );
        Ok(())
    }

    pub fn decode_codes(&self, frames: &[Vec<u32>]) -> Result<AudioBuffer> {
        let samples = self.decoder.decode(frames)?;
        Ok(AudioBuffer::new(samples, audio::SAMPLE_RATE))
    }

    fn encode_target(&self, text: &str) -> Result<Vec<u32>> {
        let ids = self.tokenizer.encode(text)?;
        if ids.is_empty() {
            bail!("text produced no tokens");
        }
        Ok(ids)
    }

    /// Sum of all 16 codebook embeddings of each reference frame: `[1, T, hidden]`.
    fn reference_codec_embeds(&self, codes: &[Vec<u32>]) -> Result<Tensor> {
        let groups = self.code_predictor.num_acoustic_groups() + 1;
        if let Some(bad) = codes.iter().find(|f| f.len() != groups) {
            bail!("reference frame has {} codes, expected {}", bad.len(), groups);
        }
        let flat: Vec<u32> = codes.iter().flatten().copied().collect();
        let codes = Tensor::from_vec(flat, (codes.len(), groups), &self.device)?;

        let mut sum = self.talker.codec_embeds_tensor(&codes.i((.., 0))?.contiguous()?)?;
        for g in 1..groups {
            let group = codes.i((.., g))?.contiguous()?;
            sum = (sum + self.code_predictor.embed_group(g - 1, &group)?)?;
        }
        Ok(sum)
    }

    /// Run the autoregressive loop after `prefill`, feeding one `trailing`
    /// text position per frame (tts_pad once exhausted).
    fn generate_frames(
        &self,
        prefill: &Tensor,
        trailing: &Tensor,
        options: &SynthesisOptions,
    ) -> Result<FrameCodes> {
        let start = Instant::now();
        let config = options.to_gen_config();
        let mut ctx = SamplingContext::new(options.seed);
        let mut processor = LogitProcessor::new(&config, self.talker.config().vocab_size);
        let mut caches = self.talker.new_caches();
        let pad = self.talker.tts_pad_embed()?;
        let n_trailing = trailing.dim(1)?;

        let (mut hidden, logits) = self.talker.forward_embeds(prefill, &mut caches, 0)?;
        let mut offset = prefill.dim(1)?;
        let mut token = Self::next_token(&logits, &mut processor, &config, &mut ctx)?;

        let mut frames = Vec::new();
        for step in 0..config.max_new_tokens {
            if Some(token) == config.eos_token_id {
                break;
            }
            let semantic = self.talker.codec_embeds(&[token])?;
            let acoustic = self.code_predictor.predict(&hidden, &semantic)?;
            let text = if step < n_trailing {
                trailing.narrow(1, step, 1)?
            } else {
                pad.clone()
            };
            let input = ((semantic + self.code_predictor.embed_sum(&acoustic)?)? + text)?;

            let mut frame = Vec::with_capacity(acoustic.len() + 1);
            frame.push(token);
            frame.extend(acoustic);
            frames.push(frame);

            let (h, logits) = self.talker.forward_embeds(&input, &mut caches, offset)?;
            hidden = h;
            offset += 1;
            token = Self::next_token(&logits, &mut processor, &config, &mut ctx)?;
        }

        tracing::debug!(
            frames = frames.len(),
            prefill = prefill.dim(1)?,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(frames)
    }

    fn next_token(
        logits: &Tensor,
        processor: &mut LogitProcessor<'_>,
        config: &GenerationConfig,
        ctx: &mut SamplingContext,
    ) -> Result<u32> {
        let mut row = logits_row(logits)?;
        processor.process(&mut row);
        let token = sample_row(row, config, ctx)?;
        processor.observe(token);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_defaults() {
        let options = SynthesisOptions::default();
        assert_eq!(options.max_length, 2048);
        assert_eq!(options.eos_token_id, Some(2150));
        assert!(options.seed.is_none());
        let config = options.to_gen_config();
        assert_eq!(config.top_k, 50);
        assert!((config.repetition_penalty - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_icl_limits() {
        let icl = SynthesisOptions::default().for_icl(10);
        assert_eq!(icl.max_length, 75);
        assert!((icl.repetition_penalty - 1.5).abs() < 1e-9);

        let icl = SynthesisOptions::default().for_icl(100);
        assert_eq!(icl.max_length, 600);

        let strict = SynthesisOptions {
            repetition_penalty: 2.0,
            max_length: 50,
            ..Default::default()
        }
        .for_icl(100);
        assert_eq!(strict.max_length, 50);
        assert!((strict.repetition_penalty - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_trim_reference_proportional() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let trimmed = trim_reference(samples, 1, 4);
        assert_eq!(trimmed.len(), 75);
        assert_eq!(trimmed[0], 25.0);
        assert!(trim_reference(vec![1.0; 10], 4, 4).is_empty());
        assert_eq!(trim_reference(vec![1.0; 10], 0, 0).len(), 10);
    }
}
