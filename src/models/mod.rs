//! Network components of the speech model.
//!
//! - `transformer`: shared Qwen3 decoder blocks (RoPE, GQA attention, KV cache)
//! - `talker`: semantic-token transformer and prompt assembly
//! - `code_predictor`: acoustic codebooks 1-15 per frame
//! - `speaker`: ECAPA-TDNN x-vector encoder
//! - `codec`: 12 Hz speech-token encoder and waveform decoder

pub mod code_predictor;
pub mod codec;
pub mod config;
pub mod speaker;
pub mod talker;
pub mod transformer;
pub mod weights;

pub use code_predictor::CodePredictor;
pub use config::{CodePredictorConfig, LayerDims, ModelConfig, ModelType, SpeakerEncoderConfig, TalkerConfig};
pub use speaker::SpeakerEncoder;
pub use talker::{Language, TalkerModel};
pub use transformer::{KvCache, RotaryEmbedding};
