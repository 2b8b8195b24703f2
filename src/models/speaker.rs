//! ECAPA-TDNN speaker encoder producing the x-vector that conditions the
//! talker on the reference voice.
//!
//! Input is a 128-bin log-mel spectrogram of 24 kHz audio; output is a raw
//! (not L2-normalized) embedding of `enc_dim` floats.

use anyhow::{ensure, Result};
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

use crate::audio::MelSpectrogram;
use crate::models::config::SpeakerEncoderConfig;

/// Mirror-pad the time axis of `[b, c, t]` without repeating the edge sample.
fn reflect_pad(x: &Tensor, left: usize, right: usize) -> candle_core::Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    let t = x.dim(2)?;
    let idx: Vec<u32> = (1..=left)
        .rev()
        .chain(0..t)
        .chain((0..right).map(|i| t - 2 - i))
        .map(|i| i as u32)
        .collect();
    let n = idx.len();
    x.contiguous()?.index_select(&Tensor::from_vec(idx, n, x.device())?, 2)
}

/// "Same"-length conv + ReLU with reflect padding.
struct Tdnn {
    conv: Conv1d,
    left: usize,
    right: usize,
}

impl Tdnn {
    fn new(c_in: usize, c_out: usize, kernel: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        let total = dilation * (kernel - 1);
        let config = Conv1dConfig {
            dilation,
            ..Default::default()
        };
        Ok(Self {
            conv: conv1d(c_in, c_out, kernel, config, vb.pp("conv"))?,
            left: total / 2,
            right: total - total / 2,
        })
    }
}

impl Module for Tdnn {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.conv.forward(&reflect_pad(x, self.left, self.right)?)?.relu()
    }
}

/// Split channels into `scale` groups; each group after the first is
/// convolved together with the previous group's output.
struct Res2Net {
    blocks: Vec<Tdnn>,
    width: usize,
}

impl Res2Net {
    fn new(channels: usize, kernel: usize, dilation: usize, scale: usize, vb: VarBuilder) -> Result<Self> {
        let width = channels / scale;
        let blocks = (0..scale - 1)
            .map(|i| Tdnn::new(width, width, kernel, dilation, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks, width })
    }
}

impl Module for Res2Net {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut outs = vec![x.narrow(1, 0, self.width)?];
        for (i, block) in self.blocks.iter().enumerate() {
            let chunk = x.narrow(1, (i + 1) * self.width, self.width)?;
            let input = match (i, outs.last()) {
                (0, _) | (_, None) => chunk,
                (_, Some(prev)) => (chunk + prev)?,
            };
            outs.push(block.forward(&input)?);
        }
        Tensor::cat(&outs, 1)
    }
}

/// Squeeze-excitation channel gating.
struct SqueezeExcite {
    conv1: Conv1d,
    conv2: Conv1d,
}

impl SqueezeExcite {
    fn new(channels: usize, se_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig::default();
        Ok(Self {
            conv1: conv1d(channels, se_channels, 1, cfg, vb.pp("conv1"))?,
            conv2: conv1d(se_channels, channels, 1, cfg, vb.pp("conv2"))?,
        })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let s = x.mean_keepdim(D::Minus1)?;
        let s = self.conv1.forward(&s)?.relu()?;
        let s = candle_nn::ops::sigmoid(&self.conv2.forward(&s)?)?;
        x.broadcast_mul(&s)
    }
}

struct SeRes2NetBlock {
    tdnn1: Tdnn,
    res2net: Res2Net,
    tdnn2: Tdnn,
    se: SqueezeExcite,
}

impl SeRes2NetBlock {
    fn new(config: &SpeakerEncoderConfig, i: usize, vb: VarBuilder) -> Result<Self> {
        let c = config.enc_channels[i];
        Ok(Self {
            tdnn1: Tdnn::new(c, c, 1, 1, vb.pp("tdnn1"))?,
            res2net: Res2Net::new(
                c,
                config.enc_kernel_sizes[i],
                config.enc_dilations[i],
                config.enc_res2net_scale,
                vb.pp("res2net_block"),
            )?,
            tdnn2: Tdnn::new(c, c, 1, 1, vb.pp("tdnn2"))?,
            se: SqueezeExcite::new(c, config.enc_se_channels, vb.pp("se_block"))?,
        })
    }
}

impl Module for SeRes2NetBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.tdnn1.forward(x)?;
        let h = self.res2net.forward(&h)?;
        let h = self.tdnn2.forward(&h)?;
        self.se.forward(&h)? + x
    }
}

/// Attentive statistics pooling: `[b, c, t]` to `[b, 2c, 1]`.
struct StatsPooling {
    tdnn: Tdnn,
    conv: Conv1d,
}

impl StatsPooling {
    const EPS: f64 = 1e-5;

    fn new(channels: usize, attention: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            tdnn: Tdnn::new(channels * 3, attention, 1, 1, vb.pp("tdnn"))?,
            conv: conv1d(attention, channels, 1, Conv1dConfig::default(), vb.pp("conv"))?,
        })
    }
}

impl Module for StatsPooling {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let var = x.broadcast_sub(&mean)?.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + Self::EPS)?.sqrt()?;

        let ctx = Tensor::cat(
            &[x, &mean.broadcast_as(x.dims())?, &std.broadcast_as(x.dims())?],
            1,
        )?;
        let attn = self.tdnn.forward(&ctx)?.tanh()?;
        let attn = candle_nn::ops::softmax_last_dim(&self.conv.forward(&attn)?)?;

        let w_mean = x.broadcast_mul(&attn)?.sum_keepdim(D::Minus1)?;
        let w_var = x
            .broadcast_sub(&w_mean)?
            .sqr()?
            .broadcast_mul(&attn)?
            .sum_keepdim(D::Minus1)?;
        let w_std = (w_var + Self::EPS)?.sqrt()?;
        Tensor::cat(&[&w_mean, &w_std], 1)
    }
}

pub struct SpeakerEncoder {
    mel: MelSpectrogram,
    stem: Tdnn,
    blocks: Vec<SeRes2NetBlock>,
    mfa: Tdnn,
    pooling: StatsPooling,
    fc: Conv1d,
    device: Device,
}

impl SpeakerEncoder {
    /// `vb` is scoped to the encoder (keys `blocks.*`, `mfa.*`, `asp.*`, `fc.*`).
    pub fn new(config: &SpeakerEncoderConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(
            config.enc_channels.len() == 5
                && config.enc_kernel_sizes.len() == 5
                && config.enc_dilations.len() == 5,
            "speaker encoder expects five channel/kernel/dilation entries"
        );
        let ch = &config.enc_channels;
        let blocks = (1..4)
            .map(|i| SeRes2NetBlock::new(config, i, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mel: MelSpectrogram::new(crate::audio::MelConfig::speaker_encoder(config.sample_rate, config.mel_dim)),
            stem: Tdnn::new(
                config.mel_dim,
                ch[0],
                config.enc_kernel_sizes[0],
                config.enc_dilations[0],
                vb.pp("blocks").pp(0),
            )?,
            blocks,
            mfa: Tdnn::new(
                ch[1..4].iter().sum(),
                ch[4],
                config.enc_kernel_sizes[4],
                config.enc_dilations[4],
                vb.pp("mfa"),
            )?,
            pooling: StatsPooling::new(ch[4], config.enc_attention_channels, vb.pp("asp"))?,
            fc: conv1d(ch[4] * 2, config.enc_dim, 1, Conv1dConfig::default(), vb.pp("fc"))?,
            device: vb.device().clone(),
        })
    }

    /// Embed mono samples already at the encoder sample rate: `[enc_dim]`.
    pub fn encode(&self, samples: &[f32]) -> Result<Tensor> {
        let mel = self.mel.compute(samples, &self.device)?;
        Ok(self.forward(&mel.unsqueeze(0)?)?.squeeze(0)?)
    }
}

impl Module for SpeakerEncoder {
    /// `[b, n_mels, t]` to `[b, enc_dim]`.
    fn forward(&self, mel: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = self.stem.forward(mel)?;
        let mut taps = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            h = block.forward(&h)?;
            taps.push(h.clone());
        }
        let h = self.mfa.forward(&Tensor::cat(&taps, 1)?)?;
        let pooled = self.pooling.forward(&h)?;
        self.fc.forward(&pooled)?.squeeze(D::Minus1)
    }
}
