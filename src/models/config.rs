//! Model configuration parsed from a HuggingFace `config.json`.
//!
//! Every field falls back to the 1.7B values, so a partial config (or an
//! empty `{}`) still yields a usable model description.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model variant, from `tts_model_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Voice cloning from reference audio (ships a speaker encoder)
    #[default]
    Base,
    /// Preset speakers; accepted in configs but not served here
    CustomVoice,
    /// Voices described by a natural-language instruction
    VoiceDesign,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::CustomVoice => write!(f, "custom_voice"),
            Self::VoiceDesign => write!(f, "voice_design"),
        }
    }
}

/// Top-level `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub tts_model_type: ModelType,
    pub tts_model_size: Option<String>,
    pub talker_config: TalkerConfig,
    pub speaker_encoder_config: Option<SpeakerEncoderConfig>,
}

impl ModelConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Human-readable label, e.g. "1.7B Base"
    pub fn label(&self) -> String {
        let size = match self.tts_model_size.as_deref() {
            Some("0b6") => "0.6B",
            Some("1b7") => "1.7B",
            Some(other) => other,
            None => "?",
        };
        format!("{} {}", size, self.tts_model_type)
    }
}

/// Talker (text → semantic codes) transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkerConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    /// Codec vocabulary, including the special codec tokens
    pub vocab_size: usize,
    pub text_vocab_size: usize,
    pub text_hidden_size: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    pub code_predictor_config: CodePredictorConfig,
}

impl Default for TalkerConfig {
    fn default() -> Self {
        Self {
            hidden_size: 2048,
            intermediate_size: 6144,
            num_hidden_layers: 28,
            num_attention_heads: 16,
            num_key_value_heads: 8,
            head_dim: 128,
            vocab_size: 3072,
            text_vocab_size: 151936,
            text_hidden_size: 2048,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            max_position_embeddings: 32768,
            code_predictor_config: CodePredictorConfig::default(),
        }
    }
}

impl TalkerConfig {
    pub fn layer_dims(&self) -> LayerDims {
        LayerDims {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads: self.num_key_value_heads,
            head_dim: self.head_dim,
            rms_norm_eps: self.rms_norm_eps,
            qk_norm: true,
        }
    }
}

/// Multi-token predictor producing the 15 acoustic codebooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodePredictorConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    /// Total code groups per frame, semantic included
    pub num_code_groups: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
}

impl Default for CodePredictorConfig {
    fn default() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 3072,
            num_hidden_layers: 5,
            num_attention_heads: 16,
            num_key_value_heads: 8,
            head_dim: 128,
            vocab_size: 2048,
            num_code_groups: 16,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
        }
    }
}

impl CodePredictorConfig {
    pub fn layer_dims(&self) -> LayerDims {
        LayerDims {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads: self.num_key_value_heads,
            head_dim: self.head_dim,
            rms_norm_eps: self.rms_norm_eps,
            qk_norm: true,
        }
    }
}

/// ECAPA-TDNN speaker encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerEncoderConfig {
    pub mel_dim: usize,
    pub enc_dim: usize,
    /// `[initial, se_res2net x3, mfa]`
    pub enc_channels: Vec<usize>,
    pub enc_kernel_sizes: Vec<usize>,
    pub enc_dilations: Vec<usize>,
    pub enc_attention_channels: usize,
    pub enc_res2net_scale: usize,
    pub enc_se_channels: usize,
    pub sample_rate: u32,
}

impl Default for SpeakerEncoderConfig {
    fn default() -> Self {
        Self {
            mel_dim: 128,
            enc_dim: 1024,
            enc_channels: vec![512, 512, 512, 512, 1536],
            enc_kernel_sizes: vec![5, 3, 3, 3, 1],
            enc_dilations: vec![1, 2, 3, 4, 1],
            enc_attention_channels: 128,
            enc_res2net_scale: 8,
            enc_se_channels: 128,
            sample_rate: 24000,
        }
    }
}

/// Shape of one pre-norm decoder layer, shared by the talker, the code
/// predictor and the codec pre-transformer.
#[derive(Debug, Clone, Copy)]
pub struct LayerDims {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    /// Per-head RMSNorm on queries and keys
    pub qk_norm: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_large_defaults() {
        let config: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tts_model_type, ModelType::Base);
        assert_eq!(config.talker_config.hidden_size, 2048);
        assert_eq!(config.talker_config.intermediate_size, 6144);
        assert_eq!(config.talker_config.code_predictor_config.num_code_groups, 16);
        assert!(config.speaker_encoder_config.is_none());
    }

    #[test]
    fn test_partial_talker_config() {
        let json = r#"{
            "tts_model_type": "voice_design",
            "tts_model_size": "1b7",
            "talker_config": {
                "hidden_size": 1024,
                "intermediate_size": 3072,
                "code_predictor_config": { "num_hidden_layers": 5 }
            },
            "speaker_encoder_config": { "enc_dim": 1024 }
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tts_model_type, ModelType::VoiceDesign);
        assert_eq!(config.talker_config.hidden_size, 1024);
        assert_eq!(config.talker_config.num_key_value_heads, 8);
        assert_eq!(config.talker_config.code_predictor_config.hidden_size, 1024);
        let se = config.speaker_encoder_config.as_ref().unwrap();
        assert_eq!(se.enc_channels, vec![512, 512, 512, 512, 1536]);
        assert_eq!(config.label(), "1.7B voice_design");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"tts_model_type": "base"}"#).unwrap();
        let config = ModelConfig::from_file(&path).unwrap();
        assert_eq!(config.tts_model_type, ModelType::Base);

        std::fs::write(&path, "not json").unwrap();
        assert!(ModelConfig::from_file(&path).is_err());
    }
}
