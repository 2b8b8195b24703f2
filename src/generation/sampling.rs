//! Token sampling for the talker's first-codebook stream.
//!
//! Logits arrive as a `[1, vocab]` (or `[1, 1, vocab]`) tensor and are pulled
//! to the host once per step; every filter below works on that row.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// RNG owned by one synthesis call.
///
/// A seeded context replays the exact token sequence for the same inputs.
pub struct SamplingContext {
    rng: StdRng,
}

impl SamplingContext {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Upper bound on generated frames
    pub max_new_tokens: usize,
    pub temperature: f64,
    /// 0 disables
    pub top_k: usize,
    /// 1.0 disables
    pub top_p: f64,
    /// 1.0 disables
    pub repetition_penalty: f64,
    pub eos_token_id: Option<u32>,
    /// EOS is masked until this many tokens exist
    pub min_new_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            temperature: 0.9,
            top_k: 50,
            top_p: 0.9,
            repetition_penalty: 1.05,
            eos_token_id: None,
            min_new_tokens: 2,
        }
    }
}

/// Flatten a logits tensor into one host row of f32.
pub fn logits_row(logits: &Tensor) -> Result<Vec<f32>> {
    Ok(logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

fn argmax(row: &[f32]) -> Result<u32> {
    row.iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| anyhow::anyhow!("cannot sample from empty logits"))
}

/// Keep the `k` largest logits; ties at the threshold survive.
fn top_k_filter(row: &mut [f32], k: usize) {
    if k == 0 || k >= row.len() {
        return;
    }
    let mut sorted = row.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for v in row.iter_mut().filter(|v| **v < threshold) {
        *v = f32::NEG_INFINITY;
    }
}

/// Nucleus filter: keep the smallest prefix of the sorted distribution whose
/// mass exceeds `p`, including the token that crosses the threshold.
fn top_p_filter(row: &mut [f32], p: f64) {
    if p <= 0.0 || p >= 1.0 {
        return;
    }
    let probs = softmax(row);
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0f64;
    let mut cut = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx] as f64;
        if cumulative > p {
            cut = rank + 1;
            break;
        }
    }
    for &idx in &order[cut..] {
        row[idx] = f32::NEG_INFINITY;
    }
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; row.len()];
    }
    let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Sample one token id from already-penalized logits.
pub fn sample_row(mut row: Vec<f32>, config: &GenerationConfig, ctx: &mut SamplingContext) -> Result<u32> {
    if row.is_empty() {
        bail!("cannot sample from empty logits");
    }
    if config.temperature < 0.01 {
        return argmax(&row);
    }
    if config.temperature != 1.0 {
        let t = config.temperature as f32;
        row.iter_mut().for_each(|v| *v /= t);
    }
    top_k_filter(&mut row, config.top_k);
    top_p_filter(&mut row, config.top_p);

    let probs = softmax(&row);
    match WeightedIndex::new(&probs) {
        Ok(dist) => Ok(dist.sample(&mut ctx.rng) as u32),
        // every candidate masked out
        Err(_) => argmax(&row),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_logits_row_flattens_step_output() {
        let logits = Tensor::new(&[[[0.1f32, 3.0, -1.0, 2.9]]], &Device::Cpu).unwrap();
        let row = logits_row(&logits).unwrap();
        assert_eq!(row.len(), 4);
        assert_eq!(argmax(&row).unwrap(), 1);
    }

    #[test]
    fn test_low_temperature_is_greedy() {
        let config = GenerationConfig {
            temperature: 0.0,
            ..Default::default()
        };
        let mut ctx = SamplingContext::new(None);
        for _ in 0..5 {
            assert_eq!(sample_row(vec![0.0, 1.0, 5.0, 4.9], &config, &mut ctx).unwrap(), 2);
        }
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let config = GenerationConfig {
            top_k: 1,
            top_p: 1.0,
            ..Default::default()
        };
        let mut ctx = SamplingContext::new(Some(1));
        for _ in 0..20 {
            assert_eq!(sample_row(vec![1.0, 2.0, 1.9, 0.0], &config, &mut ctx).unwrap(), 1);
        }
    }

    #[test]
    fn test_top_p_keeps_crossing_token() {
        // probs ~ [0.64, 0.24, 0.09, 0.03]
        let mut row = vec![3.0f32, 2.0, 1.0, 0.0];
        top_p_filter(&mut row, 0.7);
        assert!(row[0].is_finite() && row[1].is_finite());
        assert!(row[2].is_infinite() && row[3].is_infinite());
    }

    #[test]
    fn test_top_k_filter() {
        let mut row = vec![0.5f32, 0.1, 0.9, 0.3];
        top_k_filter(&mut row, 2);
        assert_eq!(row[0], 0.5);
        assert_eq!(row[2], 0.9);
        assert!(row[1].is_infinite() && row[3].is_infinite());
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let config = GenerationConfig::default();
        let row: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let draw = |seed| {
            let mut ctx = SamplingContext::new(Some(seed));
            (0..32)
                .map(|_| sample_row(row.clone(), &config, &mut ctx).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_masked_tokens_never_sampled() {
        let config = GenerationConfig {
            top_k: 0,
            top_p: 1.0,
            temperature: 1.0,
            ..Default::default()
        };
        let mut ctx = SamplingContext::new(Some(7));
        for _ in 0..100 {
            let tok = sample_row(vec![0.0, f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY], &config, &mut ctx).unwrap();
            assert!(tok == 0 || tok == 2);
        }
    }

    #[test]
    fn test_empty_logits_error() {
        let mut ctx = SamplingContext::new(Some(0));
        assert!(sample_row(Vec::new(), &GenerationConfig::default(), &mut ctx).is_err());
    }
}
