//! Talker: the autoregressive transformer that predicts the semantic
//! (first) codebook of each 12 Hz frame.
//!
//! Every input position is the sum of a projected text embedding and a
//! codec embedding. The prefix is assembled from ChatML framing tokens, the
//! codec "think" block carrying the language id, and optionally the speaker
//! x-vector; generation then feeds one fused frame embedding per step.

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};
use std::str::FromStr;

use super::config::TalkerConfig;
use super::transformer::{new_caches, run_layers, step_mask, DecoderLayer, KvCache, RotaryEmbedding};

/// ChatML framing token ids.
pub mod special_tokens {
    pub const IM_START: u32 = 151644;
    pub const IM_END: u32 = 151645;
    pub const ASSISTANT: u32 = 77091;
    pub const NEWLINE: u32 = 198;
}

/// Text-vocabulary tokens reserved for speech generation.
pub mod tts_tokens {
    pub const TTS_PAD: u32 = 151671;
    pub const TTS_BOS: u32 = 151672;
    pub const TTS_EOS: u32 = 151673;
}

/// Codec-vocabulary control tokens.
pub mod codec_tokens {
    pub const CODEC_PAD: u32 = 2148;
    pub const CODEC_BOS: u32 = 2149;
    pub const CODEC_EOS: u32 = 2150;
    pub const CODEC_THINK: u32 = 2154;
    pub const CODEC_NOTHINK: u32 = 2155;
    pub const CODEC_THINK_BOS: u32 = 2156;
    pub const CODEC_THINK_EOS: u32 = 2157;
    pub const CODEC_VOCAB_SIZE: usize = 3072;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Chinese,
    English,
    Japanese,
    Korean,
    German,
    French,
    Russian,
    Portuguese,
    Spanish,
    Italian,
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "english" | "en" => Ok(Language::English),
            "chinese" | "zh" => Ok(Language::Chinese),
            "japanese" | "ja" => Ok(Language::Japanese),
            "korean" | "ko" => Ok(Language::Korean),
            "german" | "de" => Ok(Language::German),
            "french" | "fr" => Ok(Language::French),
            "russian" | "ru" => Ok(Language::Russian),
            "portuguese" | "pt" => Ok(Language::Portuguese),
            "spanish" | "es" => Ok(Language::Spanish),
            "italian" | "it" => Ok(Language::Italian),
            _ => bail!("Unsupported language: {}", s),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Language::Chinese => "Chinese",
            Language::English => "English",
            Language::Japanese => "Japanese",
            Language::Korean => "Korean",
            Language::German => "German",
            Language::French => "French",
            Language::Russian => "Russian",
            Language::Portuguese => "Portuguese",
            Language::Spanish => "Spanish",
            Language::Italian => "Italian",
        };
        f.write_str(name)
    }
}

impl Language {
    /// Codec token that selects this language inside the think block.
    pub fn token_id(&self) -> u32 {
        match self {
            Language::Chinese => 2055,
            Language::English => 2050,
            Language::Japanese => 2058,
            Language::Korean => 2064,
            Language::German => 2053,
            Language::French => 2061,
            Language::Russian => 2069,
            Language::Portuguese => 2071,
            Language::Spanish => 2054,
            Language::Italian => 2070,
        }
    }
}

/// Two-layer SiLU MLP mapping text embeddings into the talker width.
struct TextProjection {
    fc1: Linear,
    fc2: Linear,
}

impl TextProjection {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_dim, in_dim, vb.pp("linear_fc1"))?,
            fc2: linear(in_dim, out_dim, vb.pp("linear_fc2"))?,
        })
    }
}

impl Module for TextProjection {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.silu()?)
    }
}

pub struct TalkerModel {
    text_embedding: Embedding,
    text_projection: TextProjection,
    codec_embedding: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    codec_head: Linear,
    rope: RotaryEmbedding,
    config: TalkerConfig,
    device: Device,
    dtype: DType,
}

impl TalkerModel {
    /// Build from a VarBuilder rooted at the checkpoint (keys `talker.*`).
    pub fn new(config: TalkerConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("talker");
        let vb_m = vb.pp("model");
        let dims = config.layer_dims();

        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(&dims, vb_m.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            text_embedding: embedding(
                config.text_vocab_size,
                config.text_hidden_size,
                vb_m.pp("text_embedding"),
            )?,
            text_projection: TextProjection::new(
                config.text_hidden_size,
                config.hidden_size,
                vb.pp("text_projection"),
            )?,
            codec_embedding: embedding(config.vocab_size, config.hidden_size, vb_m.pp("codec_embedding"))?,
            layers,
            norm: rms_norm(config.hidden_size, config.rms_norm_eps, vb_m.pp("norm"))?,
            codec_head: linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("codec_head"))?,
            rope: RotaryEmbedding::new(
                config.head_dim,
                config.max_position_embeddings,
                config.rope_theta,
                vb.device(),
            )?,
            device: vb.device().clone(),
            dtype: vb.dtype(),
            config,
        })
    }

    pub fn config(&self) -> &TalkerConfig {
        &self.config
    }

    pub fn new_caches(&self) -> Vec<KvCache> {
        new_caches(self.layers.len())
    }

    /// Projected text embeddings `[1, n, hidden]`; empty input gives `n = 0`.
    pub fn text_embeds(&self, ids: &[u32]) -> Result<Tensor> {
        if ids.is_empty() {
            return Ok(Tensor::zeros((1, 0, self.config.hidden_size), self.dtype, &self.device)?);
        }
        let ids = Tensor::new(ids, &self.device)?;
        let emb = self.text_embedding.forward(&ids)?.unsqueeze(0)?;
        Ok(self.text_projection.forward(&emb)?)
    }

    /// Codec embeddings `[1, n, hidden]`.
    pub fn codec_embeds(&self, ids: &[u32]) -> Result<Tensor> {
        self.codec_embeds_tensor(&Tensor::new(ids, &self.device)?)
    }

    /// Codec embeddings for a `[n]` id tensor.
    pub fn codec_embeds_tensor(&self, ids: &Tensor) -> Result<Tensor> {
        let ids = ids.to_dtype(DType::U32)?;
        Ok(self.codec_embedding.forward(&ids)?.unsqueeze(0)?)
    }

    fn role_prefix(&self) -> Result<Tensor> {
        use special_tokens::*;
        self.text_embeds(&[IM_START, ASSISTANT, NEWLINE])
    }

    /// `pads` copies of tts_pad followed by one tts_bos.
    fn pad_bos(&self, pads: usize) -> Result<Tensor> {
        use tts_tokens::*;
        let mut ids = vec![TTS_PAD; pads];
        ids.push(TTS_BOS);
        self.text_embeds(&ids)
    }

    pub fn tts_pad_embed(&self) -> Result<Tensor> {
        self.text_embeds(&[tts_tokens::TTS_PAD])
    }

    /// Prefix for cloning from a speaker x-vector.
    ///
    /// Layout: role prefix, then six tts_pad/tts_bos positions overlaid on
    /// `[think, think_bos, lang, think_eos, speaker, pad]`. Outside ICL mode a
    /// final position fuses the first text token with codec_bos.
    pub fn voice_clone_prefix(
        &self,
        text_ids: &[u32],
        speaker_embed: &Tensor,
        language: Language,
        icl: bool,
    ) -> Result<Tensor> {
        use codec_tokens::*;

        let think = self.codec_embeds(&[CODEC_THINK, CODEC_THINK_BOS, language.token_id(), CODEC_THINK_EOS])?;
        let speaker = speaker_embed
            .to_dtype(self.dtype)?
            .reshape((1, 1, self.config.hidden_size))?;
        let tail = self.codec_embeds(&[CODEC_PAD, CODEC_BOS])?;
        let codec = Tensor::cat(&[&think, &speaker, &tail], 1)?;

        let overlaid = (self.pad_bos(5)? + codec.i((.., ..6, ..))?)?;
        let mut parts = vec![self.role_prefix()?, overlaid];

        if !icl {
            if let Some(&first) = text_ids.first() {
                parts.push((self.text_embeds(&[first])? + codec.i((.., 6..7, ..))?)?);
            }
        }
        Ok(Tensor::cat(&parts, 1)?)
    }

    /// Prefix for a voice described by `instruct_ids` (already wrapped in a
    /// user chat turn). No speaker slot, so only four pads are overlaid.
    pub fn voice_design_prefix(
        &self,
        text_ids: &[u32],
        instruct_ids: &[u32],
        language: Language,
    ) -> Result<Tensor> {
        use codec_tokens::*;

        let codec = self.codec_embeds(&[
            CODEC_THINK,
            CODEC_THINK_BOS,
            language.token_id(),
            CODEC_THINK_EOS,
            CODEC_PAD,
            CODEC_BOS,
        ])?;
        let overlaid = (self.pad_bos(4)? + codec.i((.., ..5, ..))?)?;
        let mut parts = Vec::with_capacity(4);
        if !instruct_ids.is_empty() {
            parts.push(self.text_embeds(instruct_ids)?);
        }
        parts.push(self.role_prefix()?);
        parts.push(overlaid);
        if let Some(&first) = text_ids.first() {
            parts.push((self.text_embeds(&[first])? + codec.i((.., 5..6, ..))?)?);
        }
        Ok(Tensor::cat(&parts, 1)?)
    }

    /// In-context block: reference + target text aligned position-wise with
    /// codec_bos + reference frame embeddings.
    ///
    /// Returns `(block, trailing)` where `trailing` holds the text positions
    /// that did not fit and are fed one per generated frame.
    pub fn icl_block(
        &self,
        target_ids: &[u32],
        ref_text_ids: &[u32],
        ref_codec_embeds: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let mut ids = Vec::with_capacity(ref_text_ids.len() + target_ids.len() + 1);
        ids.extend_from_slice(ref_text_ids);
        ids.extend_from_slice(target_ids);
        ids.push(tts_tokens::TTS_EOS);
        let text = self.text_embeds(&ids)?;
        let n_text = text.dim(1)?;

        let bos = self.codec_embeds(&[codec_tokens::CODEC_BOS])?;
        let codec = Tensor::cat(&[&bos, &ref_codec_embeds.to_dtype(self.dtype)?], 1)?;
        let n_codec = codec.dim(1)?;
        let pad = self.tts_pad_embed()?;

        if n_text > n_codec {
            let block = (text.narrow(1, 0, n_codec)? + codec)?;
            let trailing = text.narrow(1, n_codec, n_text - n_codec)?;
            Ok((block, trailing))
        } else {
            let text = if n_codec > n_text {
                let fill = pad.broadcast_as((1, n_codec - n_text, self.config.hidden_size))?;
                Tensor::cat(&[&text, &fill.contiguous()?], 1)?
            } else {
                text
            };
            Ok(((text + codec)?, pad))
        }
    }

    /// Text fed alongside generated frames outside ICL mode: every token
    /// after the first, then tts_eos.
    pub fn trailing_text(&self, text_ids: &[u32]) -> Result<Tensor> {
        let rest = text_ids.get(1..).unwrap_or(&[]);
        let mut ids = rest.to_vec();
        ids.push(tts_tokens::TTS_EOS);
        self.text_embeds(&ids)
    }

    /// Run `embeds` through the stack at `offset`, returning the normed
    /// hidden state of the last position `[1, 1, hidden]` and its codec
    /// logits `[1, 1, vocab]`.
    pub fn forward_embeds(
        &self,
        embeds: &Tensor,
        caches: &mut [KvCache],
        offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let seq_len = embeds.dim(1)?;
        if seq_len == 0 {
            bail!("talker forward called with an empty sequence");
        }
        let mask = step_mask(seq_len, offset, self.dtype, &self.device)?;
        let hidden = run_layers(&self.layers, embeds, &self.rope, mask.as_ref(), caches, offset)?;
        let last = hidden.narrow(1, seq_len - 1, 1)?;
        let last = self.norm.forward(&last)?;
        let logits = self.codec_head.forward(&last)?;
        Ok((last, logits))
    }
}
