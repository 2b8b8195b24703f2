//! Autoregressive decoding helpers: sampling strategies and codec-specific
//! logit shaping.

mod sampling;
pub mod tts;

pub use sampling::{logits_row, sample_row, GenerationConfig, SamplingContext};
pub use tts::{apply_repetition_penalty, LogitProcessor, SuppressionMask};
