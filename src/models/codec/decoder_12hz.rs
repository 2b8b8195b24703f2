//! 12 Hz speech-token decoder: 16-codebook frames to 24 kHz waveform.
//!
//! Pipeline: split RVQ lookup, causal pre-conv, an 8-layer causal
//! transformer with layer scale, two ConvNeXt upsampling stages (x4), then
//! the SnakeBeta waveform decoder (x8 x5 x4 x3). Each frame yields
//! `4 * 480 = 1920` samples.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{rms_norm, Linear, RmsNorm, VarBuilder};
use std::collections::HashMap;

use super::layers::{CausalConv1d, CausalTransConv1d, ConvNeXtBlock, DecoderBlock, SnakeBeta};
use crate::models::config::LayerDims;
use crate::models::transformer::{causal_mask, DecoderLayer, RotaryEmbedding};
use crate::models::weights::Weights;

#[derive(Debug, Clone)]
pub struct Decoder12HzConfig {
    pub num_quantizers: usize,
    pub codebook_size: usize,
    pub transformer: LayerDims,
    pub num_layers: usize,
    pub rope_theta: f64,
    pub max_frames: usize,
    /// Transposed-conv strides ahead of the waveform decoder
    pub upsampling_ratios: Vec<usize>,
    /// Strides of the SnakeBeta decoder blocks
    pub upsample_rates: Vec<usize>,
}

impl Default for Decoder12HzConfig {
    fn default() -> Self {
        Self {
            num_quantizers: 16,
            codebook_size: 2048,
            transformer: LayerDims {
                hidden_size: 512,
                intermediate_size: 1024,
                num_attention_heads: 16,
                num_key_value_heads: 16,
                head_dim: 64,
                rms_norm_eps: 1e-5,
                qk_norm: false,
            },
            num_layers: 8,
            rope_theta: 10000.0,
            max_frames: 8192,
            upsampling_ratios: vec![2, 2],
            upsample_rates: vec![8, 5, 4, 3],
        }
    }
}

impl Decoder12HzConfig {
    pub fn samples_per_frame(&self) -> usize {
        self.upsampling_ratios
            .iter()
            .chain(self.upsample_rates.iter())
            .product()
    }
}

/// Codebook entries are stored as running sums; divide by usage counts.
fn load_codebook(w: &Weights) -> Result<Tensor> {
    let sum = w.get("embedding_sum")?.to_dtype(DType::F32)?;
    let usage = w.get("cluster_usage")?.to_dtype(DType::F32)?.clamp(1e-7f32, f32::MAX)?;
    Ok(sum.broadcast_div(&usage.unsqueeze(1)?)?)
}

/// `[out, in, 1]` 1x1 conv weight as a `[in, out]` matmul operand.
fn load_projection(w: &Weights) -> Result<Tensor> {
    Ok(w.get("weight")?.squeeze(2)?.t()?.contiguous()?)
}

pub struct Decoder12Hz {
    config: Decoder12HzConfig,
    first_codebook: Tensor,
    rest_codebooks: Vec<Tensor>,
    first_proj: Tensor,
    rest_proj: Tensor,
    pre_conv: CausalConv1d,
    input_proj: Linear,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    output_proj: Linear,
    rope: RotaryEmbedding,
    upsample: Vec<(CausalTransConv1d, ConvNeXtBlock)>,
    head: CausalConv1d,
    blocks: Vec<DecoderBlock>,
    final_act: SnakeBeta,
    final_conv: CausalConv1d,
    device: Device,
}

impl Decoder12Hz {
    /// Build from the speech-tokenizer checkpoint (keys `decoder.*`), in F32.
    pub fn from_weights(
        tensors: HashMap<String, Tensor>,
        config: Decoder12HzConfig,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
        let w = Weights::new(tensors).pp("decoder");
        let vb = vb.pp("decoder");

        let q = w.pp("quantizer");
        let first_codebook = load_codebook(&q.pp("rvq_first.vq.layers.0._codebook"))?;
        let rest_codebooks = (0..config.num_quantizers - 1)
            .map(|i| load_codebook(&q.pp(format!("rvq_rest.vq.layers.{i}._codebook"))))
            .collect::<Result<Vec<_>>>()?;

        let tw = w.pp("pre_transformer");
        let tvb = vb.pp("pre_transformer");
        let dims = config.transformer;
        let layers = (0..config.num_layers)
            .map(|i| DecoderLayer::with_layer_scale(&dims, tvb.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let upsample = config
            .upsampling_ratios
            .iter()
            .enumerate()
            .map(|(i, &ratio)| {
                let s = w.pp("upsample").pp(i);
                Ok((
                    CausalTransConv1d::load(&s.pp(0).pp("conv"), ratio)?,
                    ConvNeXtBlock::load(&s.pp(1))?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let dw = w.pp("decoder");
        let n_blocks = config.upsample_rates.len();
        let blocks = config
            .upsample_rates
            .iter()
            .enumerate()
            .map(|(i, &rate)| DecoderBlock::load(&dw.pp(i + 1).pp("block"), rate))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            first_codebook,
            rest_codebooks,
            first_proj: load_projection(&q.pp("rvq_first.output_proj"))?,
            rest_proj: load_projection(&q.pp("rvq_rest.output_proj"))?,
            pre_conv: CausalConv1d::load(&w.pp("pre_conv.conv"), 1, 1)?,
            input_proj: Linear::new(tw.get("input_proj.weight")?, Some(tw.get("input_proj.bias")?)),
            layers,
            norm: rms_norm(dims.hidden_size, dims.rms_norm_eps, tvb.pp("norm"))?,
            output_proj: Linear::new(tw.get("output_proj.weight")?, Some(tw.get("output_proj.bias")?)),
            rope: RotaryEmbedding::new(dims.head_dim, config.max_frames, config.rope_theta, device)?,
            upsample,
            head: CausalConv1d::load(&dw.pp("0.conv"), 1, 1)?,
            blocks,
            final_act: SnakeBeta::load(&dw.pp(n_blocks + 1))?,
            final_conv: CausalConv1d::load(&dw.pp(format!("{}.conv", n_blocks + 2)), 1, 1)?,
            device: device.clone(),
            config,
        })
    }

    pub fn samples_per_frame(&self) -> usize {
        self.config.samples_per_frame()
    }

    /// Look up and project one frame sequence: `[1, 512, T]`.
    fn quantizer_decode(&self, frames: &[Vec<u32>]) -> Result<Tensor> {
        let n = self.config.num_quantizers;
        let group = |q: usize| -> Result<Tensor> {
            let ids: Vec<u32> = frames.iter().map(|f| f[q]).collect();
            Ok(Tensor::new(ids, &self.device)?)
        };

        let first_ids: Vec<u32> = frames
            .iter()
            .map(|f| f[0] % self.config.codebook_size as u32)
            .collect();
        let first = self
            .first_codebook
            .index_select(&Tensor::new(first_ids, &self.device)?, 0)?;
        let mut rest = self.rest_codebooks[0].index_select(&group(1)?, 0)?;
        for q in 2..n {
            rest = (rest + self.rest_codebooks[q - 1].index_select(&group(q)?, 0)?)?;
        }

        let quantized = (first.matmul(&self.first_proj)? + rest.matmul(&self.rest_proj)?)?;
        Ok(quantized.t()?.unsqueeze(0)?)
    }

    /// Decode `[T][16]` frames to mono samples in `[-1, 1]`.
    pub fn decode(&self, frames: &[Vec<u32>]) -> Result<Vec<f32>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = frames.iter().find(|f| f.len() != self.config.num_quantizers) {
            bail!(
                "codec frame has {} codes, expected {}",
                bad.len(),
                self.config.num_quantizers
            );
        }
        let t = frames.len();
        if t > self.config.max_frames {
            bail!("{} frames exceed the decoder limit of {}", t, self.config.max_frames);
        }

        let x = self.quantizer_decode(frames)?;
        let x = self.pre_conv.forward(&x)?.transpose(1, 2)?;

        let mut h = self.input_proj.forward(&x)?;
        let mask = causal_mask(t, 0, DType::F32, &self.device)?;
        for layer in &self.layers {
            h = layer.forward(&h, &self.rope, Some(&mask), None, 0)?;
        }
        let h = self.output_proj.forward(&self.norm.forward(&h)?)?;

        let mut h = h.transpose(1, 2)?.contiguous()?;
        for (up, convnext) in &self.upsample {
            h = convnext.forward(&up.forward(&h)?)?;
        }
        h = self.head.forward(&h)?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let wav = self
            .final_conv
            .forward(&self.final_act.forward(&h)?)?
            .clamp(-1f32, 1f32)?;
        Ok(wav.flatten_all()?.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Decoder12HzConfig::default();
        assert_eq!(config.num_quantizers, 16);
        assert_eq!(config.upsample_rates, vec![8, 5, 4, 3]);
        assert_eq!(config.samples_per_frame(), 1920);
        assert_eq!(config.transformer.num_attention_heads * config.transformer.head_dim, 1024);
    }

    #[test]
    fn test_codebook_normalization() {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "cb.embedding_sum".to_string(),
            Tensor::new(&[[2f32, 4.], [3., 3.]], &device).unwrap(),
        );
        map.insert("cb.cluster_usage".to_string(), Tensor::new(&[2f32, 0.], &device).unwrap());
        let cb = load_codebook(&Weights::new(map).pp("cb")).unwrap();
        let rows: Vec<Vec<f32>> = cb.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1.0, 2.0]);
        // zero usage is clamped rather than dividing by zero
        assert!(rows[1][0].is_finite() && rows[1][0] > 1e6);
    }

    #[test]
    fn test_missing_weights_fail_cleanly() {
        let err = Decoder12Hz::from_weights(HashMap::new(), Decoder12HzConfig::default(), &Device::Cpu);
        assert!(err.is_err());
    }
}
