//! Audio plumbing: WAV/MP3 loading, 16-bit WAV encoding, resampling and the
//! log-mel front end of the speaker encoder.

mod decode;
mod io;
mod mel;
pub mod resample;

pub use decode::{decode_file, load_audio};
pub use io::{load_wav, save_wav, wav_from_bytes, AudioBuffer};
pub use mel::{MelConfig, MelSpectrogram};
pub use resample::{resample, resample_to_24k};

/// Output rate of the speech decoder and input rate of the speaker encoder
pub const SAMPLE_RATE: u32 = 24000;

/// Mel bands fed to the speaker encoder
pub const N_MELS: usize = 128;
