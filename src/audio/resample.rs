//! Band-limited sample-rate conversion with rubato's sinc resampler.

use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::{AudioBuffer, SAMPLE_RATE};

const CHUNK_SIZE: usize = 1024;

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Resample mono audio to `target_rate`. Output length is
/// `ceil(len * target / source)` with the filter delay removed.
pub fn resample(audio: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if audio.sample_rate == target_rate || audio.is_empty() {
        return Ok(AudioBuffer::new(audio.samples.clone(), target_rate));
    }
    let ratio = target_rate as f64 / audio.sample_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_params(), CHUNK_SIZE, 1)
        .context("Failed to create sinc resampler")?;

    let (src, dst) = (audio.sample_rate as u64, target_rate as u64);
    let expected = ((audio.len() as u64 * dst + src - 1) / src) as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + CHUNK_SIZE);

    let mut chunks = audio.samples.chunks_exact(CHUNK_SIZE);
    for chunk in chunks.by_ref() {
        let frames = resampler.process(&[chunk], None).context("Resampling failed")?;
        out.extend_from_slice(&frames[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let frames = resampler
            .process_partial(Some(&[tail][..]), None)
            .context("Resampling failed")?;
        out.extend_from_slice(&frames[0]);
    }
    // Flush the filter until the delayed samples are out.
    while out.len() < expected + delay {
        let frames = resampler
            .process_partial::<&[f32]>(None, None)
            .context("Resampling failed")?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let end = (delay + expected).min(out.len());
    let samples = out.get(delay..end).map(<[f32]>::to_vec).unwrap_or_default();
    Ok(AudioBuffer::new(samples, target_rate))
}

/// Resample to the model's 24 kHz rate.
pub fn resample_to_24k(audio: &AudioBuffer) -> Result<AudioBuffer> {
    resample(audio, SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(freq: f32, rate: u32, secs: f32) -> AudioBuffer {
        let n = (rate as f32 * secs) as usize;
        let samples = (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect();
        AudioBuffer::new(samples, rate)
    }

    #[test]
    fn test_same_rate_is_passthrough() {
        let audio = tone(440.0, 24000, 0.1);
        let out = resample(&audio, 24000).unwrap();
        assert_eq!(out.samples, audio.samples);
    }

    #[test]
    fn test_upsample_length() {
        let audio = tone(440.0, 16000, 0.5);
        let out = resample_to_24k(&audio).unwrap();
        assert_eq!(out.sample_rate, 24000);
        assert_eq!(out.len(), 12000);
    }

    #[test]
    fn test_downsample_keeps_amplitude() {
        let audio = tone(440.0, 44100, 0.5);
        let out = resample(&audio, 24000).unwrap();
        assert_eq!(out.len(), 12000);
        let peak = out.samples[2000..10000].iter().fold(0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.05, "peak {peak}");
    }
}
