//! Log-mel spectrogram with a Slaney-normalized filterbank.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub fmin: f32,
    /// Defaults to Nyquist
    pub fmax: Option<f32>,
}

impl MelConfig {
    /// Parameters the ECAPA-TDNN speaker encoder was trained with.
    pub fn speaker_encoder(sample_rate: u32, n_mels: usize) -> Self {
        Self {
            sample_rate,
            n_fft: 1024,
            hop_length: 256,
            n_mels,
            fmin: 0.0,
            fmax: None,
        }
    }
}

impl Default for MelConfig {
    fn default() -> Self {
        Self::speaker_encoder(super::SAMPLE_RATE, super::N_MELS)
    }
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
// ln(6.4) / 27
const LOGSTEP: f32 = 0.068_751_74;

fn hz_to_mel(f: f32) -> f32 {
    if f < MIN_LOG_HZ {
        f / F_SP
    } else {
        MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(m: f32) -> f32 {
    if m < MIN_LOG_MEL {
        m * F_SP
    } else {
        MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// `[n_mels][n_fft / 2 + 1]` triangular filters, area-normalized.
fn filterbank(config: &MelConfig) -> Vec<Vec<f32>> {
    let n_freqs = config.n_fft / 2 + 1;
    let fmax = config.fmax.unwrap_or(config.sample_rate as f32 / 2.0);
    let (lo, hi) = (hz_to_mel(config.fmin), hz_to_mel(fmax));
    let hz: Vec<f32> = (0..config.n_mels + 2)
        .map(|i| mel_to_hz(lo + (hi - lo) * i as f32 / (config.n_mels + 1) as f32))
        .collect();
    let bin_hz = config.sample_rate as f32 / config.n_fft as f32;

    (0..config.n_mels)
        .map(|m| {
            let (left, center, right) = (hz[m], hz[m + 1], hz[m + 2]);
            let enorm = 2.0 / (right - left);
            (0..n_freqs)
                .map(|k| {
                    let f = k as f32 * bin_hz;
                    let up = (f - left) / (center - left);
                    let down = (right - f) / (right - center);
                    up.min(down).max(0.0) * enorm
                })
                .collect()
        })
        .collect()
}

/// Periodic Hann window.
fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Mirror `pad` samples onto each end, excluding the edge sample itself.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| samples[i.min(n - 1)]));
    out.extend_from_slice(samples);
    out.extend((0..pad).map(|i| samples[n.saturating_sub(2 + i)]));
    out
}

pub struct MelSpectrogram {
    config: MelConfig,
    filters: Vec<Vec<f32>>,
    window: Vec<f32>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        Self {
            filters: filterbank(&config),
            window: hann(config.n_fft),
            config,
        }
    }

    pub fn n_mels(&self) -> usize {
        self.config.n_mels
    }

    /// Log-magnitude mel frames, `[frames][n_mels]`.
    pub fn frames(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        let (n_fft, hop) = (self.config.n_fft, self.config.hop_length);
        ensure!(
            samples.len() > (n_fft - hop) / 2,
            "audio too short for mel analysis ({} samples)",
            samples.len()
        );
        let padded = reflect_pad(samples, (n_fft - hop) / 2);
        ensure!(padded.len() >= n_fft, "audio too short for one {n_fft}-point frame");

        let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);
        let n_frames = (padded.len() - n_fft) / hop + 1;
        let mut buf = vec![Complex::new(0.0f32, 0.0); n_fft];

        Ok((0..n_frames)
            .map(|t| {
                let frame = &padded[t * hop..t * hop + n_fft];
                for (b, (&s, &w)) in buf.iter_mut().zip(frame.iter().zip(&self.window)) {
                    *b = Complex::new(s * w, 0.0);
                }
                fft.process(&mut buf);
                let mag: Vec<f32> = buf[..n_fft / 2 + 1]
                    .iter()
                    .map(|c| (c.norm_sqr() + 1e-9).sqrt())
                    .collect();
                self.filters
                    .iter()
                    .map(|f| f.iter().zip(&mag).map(|(a, b)| a * b).sum::<f32>().max(1e-5).ln())
                    .collect()
            })
            .collect())
    }

    /// Log-mel spectrogram as a `[n_mels, frames]` tensor.
    pub fn compute(&self, samples: &[f32], device: &Device) -> Result<Tensor> {
        let frames = self.frames(samples)?;
        let n = frames.len();
        let flat: Vec<f32> = frames.into_iter().flatten().collect();
        Ok(Tensor::from_vec(flat, (n, self.config.n_mels), device)?.t()?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_round_trips_at_break() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-4);
        assert!((mel_to_hz(15.0) - 1000.0).abs() < 1e-2);
        assert!((mel_to_hz(hz_to_mel(4321.0)) - 4321.0).abs() < 0.5);
    }

    #[test]
    fn test_filterbank_is_nonnegative_and_covers_bins() {
        let config = MelConfig::default();
        let fb = filterbank(&config);
        assert_eq!(fb.len(), 128);
        assert_eq!(fb[0].len(), 513);
        assert!(fb.iter().flatten().all(|&v| v >= 0.0));
        assert!(fb.iter().all(|f| f.iter().any(|&v| v > 0.0)));
    }

    #[test]
    fn test_reflect_pad() {
        assert_eq!(reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2), vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_frame_count_and_tensor_shape() {
        let mel = MelSpectrogram::new(MelConfig::default());
        let samples: Vec<f32> = (0..24000).map(|i| (i as f32 * 0.1).sin()).collect();
        let frames = mel.frames(&samples).unwrap();
        // padded = 24000 + 768, frames = (24768 - 1024) / 256 + 1
        assert_eq!(frames.len(), 93);
        let t = mel.compute(&samples, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[128, 93]);
    }

    #[test]
    fn test_tone_energy_lands_in_matching_band() {
        let mel = MelSpectrogram::new(MelConfig::default());
        let low: Vec<f32> = (0..12000).map(|i| (2.0 * PI * 200.0 * i as f32 / 24000.0).sin()).collect();
        let high: Vec<f32> = (0..12000).map(|i| (2.0 * PI * 6000.0 * i as f32 / 24000.0).sin()).collect();
        let argmax = |frame: &Vec<f32>| {
            frame
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
                .0
        };
        let lo = argmax(&mel.frames(&low).unwrap()[10]);
        let hi = argmax(&mel.frames(&high).unwrap()[10]);
        assert!(lo < hi);
    }

    #[test]
    fn test_too_short_audio_is_an_error() {
        let mel = MelSpectrogram::new(MelConfig::default());
        assert!(mel.frames(&[0.0; 10]).is_err());
    }
}
