//! Convolutional building blocks of the codec decoder.
//!
//! All layers are causal: convolutions pad on the left only and transposed
//! convolutions trim the right overhang, so each output sample depends on
//! past inputs alone.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, LayerNorm, Linear};

use crate::models::weights::Weights;

/// Conv1d with `dilation * (kernel - 1)` zeros of left padding.
pub struct CausalConv1d {
    conv: Conv1d,
    left_pad: usize,
}

impl CausalConv1d {
    /// Loads `weight` `[out, in / groups, k]` and `bias` from `w`.
    pub fn load(w: &Weights, dilation: usize, groups: usize) -> Result<Self> {
        let weight = w.get("weight")?;
        let kernel = weight.dim(2)?;
        let config = Conv1dConfig {
            padding: 0,
            stride: 1,
            dilation,
            groups,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv1d::new(weight, Some(w.get("bias")?), config),
            left_pad: dilation * (kernel - 1),
        })
    }
}

impl Module for CausalConv1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = if self.left_pad > 0 {
            x.pad_with_zeros(2, self.left_pad, 0)?
        } else {
            x.clone()
        };
        self.conv.forward(&x)
    }
}

/// Transposed conv upsampling by `stride`, trimmed to `T * stride` samples.
pub struct CausalTransConv1d {
    conv: ConvTranspose1d,
    right_trim: usize,
}

impl CausalTransConv1d {
    pub fn load(w: &Weights, stride: usize) -> Result<Self> {
        let weight = w.get("weight")?;
        let kernel = weight.dim(2)?;
        let config = ConvTranspose1dConfig {
            padding: 0,
            output_padding: 0,
            stride,
            dilation: 1,
            groups: 1,
        };
        Ok(Self {
            conv: ConvTranspose1d::new(weight, Some(w.get("bias")?), config),
            right_trim: kernel.saturating_sub(stride),
        })
    }
}

impl Module for CausalTransConv1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.conv.forward(x)?;
        let len = out.dim(2)?;
        out.narrow(2, 0, len.saturating_sub(self.right_trim))
    }
}

/// `x + 1/(e^beta + eps) * sin^2(e^alpha * x)` with per-channel log-scale
/// parameters.
pub struct SnakeBeta {
    alpha: Tensor,
    inv_beta: Tensor,
}

impl SnakeBeta {
    const EPS: f64 = 1e-9;

    pub fn load(w: &Weights) -> Result<Self> {
        Self::from_params(w.get("alpha")?, w.get("beta")?)
    }

    pub fn from_params(alpha: Tensor, beta: Tensor) -> Result<Self> {
        let alpha = alpha.exp()?.reshape((1, (), 1))?;
        let inv_beta = (beta.exp()? + Self::EPS)?.recip()?.reshape((1, (), 1))?;
        Ok(Self { alpha, inv_beta })
    }
}

impl Module for SnakeBeta {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let s = x.broadcast_mul(&self.alpha)?.sin()?.sqr()?;
        x + s.broadcast_mul(&self.inv_beta)?
    }
}

/// Depthwise causal conv, LayerNorm, GELU MLP, gamma scale, residual.
pub struct ConvNeXtBlock {
    dwconv: CausalConv1d,
    norm: LayerNorm,
    pwconv1: Linear,
    pwconv2: Linear,
    gamma: Tensor,
}

impl ConvNeXtBlock {
    pub fn load(w: &Weights) -> Result<Self> {
        let gamma = w.get("gamma")?;
        let dim = gamma.dim(0)?;
        Ok(Self {
            dwconv: CausalConv1d::load(&w.pp("dwconv").pp("conv"), 1, dim)?,
            norm: LayerNorm::new(w.get("norm.weight")?, w.get("norm.bias")?, 1e-6),
            pwconv1: Linear::new(w.get("pwconv1.weight")?, Some(w.get("pwconv1.bias")?)),
            pwconv2: Linear::new(w.get("pwconv2.weight")?, Some(w.get("pwconv2.bias")?)),
            gamma,
        })
    }
}

impl Module for ConvNeXtBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.dwconv.forward(x)?.transpose(1, 2)?;
        let h = self.norm.forward(&h)?;
        let h = self.pwconv1.forward(&h)?.gelu_erf()?;
        let h = self.pwconv2.forward(&h)?.broadcast_mul(&self.gamma)?;
        x + h.transpose(1, 2)?
    }
}

/// Snake, dilated k=7 conv, snake, k=1 conv, residual.
pub struct ResidualUnit {
    act1: SnakeBeta,
    conv1: CausalConv1d,
    act2: SnakeBeta,
    conv2: CausalConv1d,
}

impl ResidualUnit {
    pub fn load(w: &Weights, dilation: usize) -> Result<Self> {
        Ok(Self {
            act1: SnakeBeta::load(&w.pp("act1"))?,
            conv1: CausalConv1d::load(&w.pp("conv1").pp("conv"), dilation, 1)?,
            act2: SnakeBeta::load(&w.pp("act2"))?,
            conv2: CausalConv1d::load(&w.pp("conv2").pp("conv"), 1, 1)?,
        })
    }
}

impl Module for ResidualUnit {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv1.forward(&self.act1.forward(x)?)?;
        let h = self.conv2.forward(&self.act2.forward(&h)?)?;
        x + h
    }
}

/// One upsampling stage of the waveform decoder: snake, transposed conv by
/// `rate`, then residual units at dilations 1, 3 and 9.
pub struct DecoderBlock {
    snake: SnakeBeta,
    upsample: CausalTransConv1d,
    units: Vec<ResidualUnit>,
}

impl DecoderBlock {
    pub const DILATIONS: [usize; 3] = [1, 3, 9];

    /// `w` points at `decoder.decoder.{i}.block`.
    pub fn load(w: &Weights, rate: usize) -> Result<Self> {
        let units = Self::DILATIONS
            .iter()
            .enumerate()
            .map(|(j, &d)| ResidualUnit::load(&w.pp(j + 2), d))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            snake: SnakeBeta::load(&w.pp(0))?,
            upsample: CausalTransConv1d::load(&w.pp(1).pp("conv"), rate)?,
            units,
        })
    }
}

impl Module for DecoderBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = self.upsample.forward(&self.snake.forward(x)?)?;
        for unit in &self.units {
            h = unit.forward(&h)?;
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn weights(entries: Vec<(&str, Tensor)>) -> Weights {
        Weights::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<HashMap<_, _>>())
    }

    #[test]
    fn test_causal_conv_keeps_length_and_is_causal() {
        let w = weights(vec![
            ("weight", Tensor::ones((1, 1, 3), DType::F32, &Device::Cpu).unwrap()),
            ("bias", zeros(&[1])),
        ]);
        let conv = CausalConv1d::load(&w, 1, 1).unwrap();
        let x = Tensor::new(&[[[1f32, 0., 0., 0., 0.]]], &Device::Cpu).unwrap();
        let y: Vec<f32> = conv.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // An impulse at t=0 spreads forward in time only.
        assert_eq!(y, vec![1., 1., 1., 0., 0.]);
    }

    #[test]
    fn test_trans_conv_upsamples_exactly() {
        let w = weights(vec![("weight", zeros(&[4, 2, 10])), ("bias", zeros(&[2]))]);
        let up = CausalTransConv1d::load(&w, 5).unwrap();
        let y = up.forward(&zeros(&[1, 4, 7])).unwrap();
        assert_eq!(y.dims(), &[1, 2, 35]);
    }

    #[test]
    fn test_snake_beta_zero_input_is_zero() {
        let snake = SnakeBeta::from_params(zeros(&[3]), zeros(&[3])).unwrap();
        let y = snake.forward(&zeros(&[1, 3, 4])).unwrap();
        let max = y.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn test_convnext_block_with_zero_gamma_is_identity() {
        let dim = 4;
        let w = weights(vec![
            ("gamma", zeros(&[dim])),
            ("dwconv.conv.weight", zeros(&[dim, 1, 7])),
            ("dwconv.conv.bias", zeros(&[dim])),
            ("norm.weight", Tensor::ones(dim, DType::F32, &Device::Cpu).unwrap()),
            ("norm.bias", zeros(&[dim])),
            ("pwconv1.weight", zeros(&[4 * dim, dim])),
            ("pwconv1.bias", zeros(&[4 * dim])),
            ("pwconv2.weight", zeros(&[dim, 4 * dim])),
            ("pwconv2.bias", zeros(&[dim])),
        ]);
        let block = ConvNeXtBlock::load(&w).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, dim, 9), &Device::Cpu).unwrap();
        let y = block.forward(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }
}
