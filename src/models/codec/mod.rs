//! Speech-token codec: frames of 16 codes at 12.5 Hz to and from 24 kHz audio.

pub mod decoder_12hz;
pub mod encoder_12hz;
pub mod layers;

pub use decoder_12hz::{Decoder12Hz, Decoder12HzConfig};
pub use encoder_12hz::Encoder12Hz;
