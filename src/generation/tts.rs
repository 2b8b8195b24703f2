//! Logit shaping specific to codec-token generation: repetition penalty,
//! the reserved control-token band and the minimum-length EOS gate.

use std::collections::HashSet;

use super::GenerationConfig;

/// Width of the reserved band at the top of the codec vocabulary.
pub const CONTROL_BAND: usize = 1024;

/// Precomputed per-token suppression flags for one vocabulary/EOS pair.
#[derive(Debug, Clone)]
pub struct SuppressionMask {
    suppressed: Vec<bool>,
}

impl SuppressionMask {
    /// Flags `[vocab - 1024, vocab)` except the EOS id.
    pub fn new(vocab_size: usize, eos_token_id: Option<u32>) -> Self {
        let start = vocab_size.saturating_sub(CONTROL_BAND);
        let suppressed = (0..vocab_size)
            .map(|i| i >= start && Some(i as u32) != eos_token_id)
            .collect();
        Self { suppressed }
    }

    pub fn apply(&self, logits: &mut [f32]) {
        for (v, &suppress) in logits.iter_mut().zip(&self.suppressed) {
            if suppress {
                *v = f32::NEG_INFINITY;
            }
        }
    }
}

/// HF-style penalty: divide positive logits, multiply negative ones.
pub fn apply_repetition_penalty(logits: &mut [f32], seen: &HashSet<u32>, penalty: f64) {
    if (penalty - 1.0).abs() < f64::EPSILON {
        return;
    }
    let penalty = penalty as f32;
    for &tok in seen {
        if let Some(v) = logits.get_mut(tok as usize) {
            *v = if *v > 0.0 { *v / penalty } else { *v * penalty };
        }
    }
}

/// All logit shaping for one step, in the order the sampler expects.
pub struct LogitProcessor<'a> {
    config: &'a GenerationConfig,
    mask: SuppressionMask,
    seen: HashSet<u32>,
    generated: usize,
}

impl<'a> LogitProcessor<'a> {
    pub fn new(config: &'a GenerationConfig, vocab_size: usize) -> Self {
        Self {
            config,
            mask: SuppressionMask::new(vocab_size, config.eos_token_id),
            seen: HashSet::new(),
            generated: 0,
        }
    }

    pub fn process(&self, logits: &mut [f32]) {
        apply_repetition_penalty(logits, &self.seen, self.config.repetition_penalty);
        self.mask.apply(logits);
        if let Some(eos) = self.config.eos_token_id {
            if self.generated < self.config.min_new_tokens {
                if let Some(v) = logits.get_mut(eos as usize) {
                    *v = f32::NEG_INFINITY;
                }
            }
        }
    }

    /// Record a sampled token.
    pub fn observe(&mut self, token: u32) {
        self.seen.insert(token);
        self.generated += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_band_suppressed_except_eos() {
        let mut logits = vec![1.0f32; 3072];
        SuppressionMask::new(3072, Some(2150)).apply(&mut logits);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[2047], 1.0);
        assert!(logits[2048].is_infinite());
        assert!(logits[2149].is_infinite());
        assert_eq!(logits[2150], 1.0);
        assert!(logits[3071].is_infinite());
    }

    #[test]
    fn test_repetition_penalty_sign_aware() {
        let mut logits = vec![2.0f32, -2.0, 2.0];
        let seen: HashSet<u32> = [0, 1].into_iter().collect();
        apply_repetition_penalty(&mut logits, &seen, 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 2.0]);
    }

    #[test]
    fn test_eos_gated_until_min_tokens() {
        let config = GenerationConfig {
            eos_token_id: Some(2150),
            min_new_tokens: 2,
            repetition_penalty: 1.0,
            ..Default::default()
        };
        let mut proc = LogitProcessor::new(&config, 3072);
        let mut logits = vec![0.0f32; 3072];
        proc.process(&mut logits);
        assert!(logits[2150].is_infinite());

        proc.observe(5);
        proc.observe(6);
        let mut logits = vec![0.0f32; 3072];
        proc.process(&mut logits);
        assert_eq!(logits[2150], 0.0);
    }

    #[test]
    fn test_processor_penalizes_observed() {
        let config = GenerationConfig {
            repetition_penalty: 1.5,
            ..Default::default()
        };
        let mut proc = LogitProcessor::new(&config, 3072);
        proc.observe(10);
        let mut logits = vec![3.0f32; 3072];
        proc.process(&mut logits);
        assert_eq!(logits[10], 2.0);
        assert_eq!(logits[11], 3.0);
    }
}
