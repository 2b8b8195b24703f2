//! Shared transformer building blocks: KV cache, rotary embedding,
//! grouped-query attention, SwiGLU MLP and the pre-norm decoder layer.
//!
//! The talker, the code predictor and the codec pre-transformer are all
//! stacks of [`DecoderLayer`]; they differ only in [`LayerDims`] and in
//! whether the residual branches carry a learned layer scale.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, rms_norm, Linear, RmsNorm, VarBuilder};

#[cfg(feature = "flash-attn")]
use candle_flash_attn::flash_attn;

use super::config::LayerDims;

/// Growing key/value cache, concatenated along the sequence axis.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `[b, h, s, d]` keys/values and return the full cached tensors.
    pub fn update(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match (&self.k, &self.v) {
            (Some(pk), Some(pv)) => (Tensor::cat(&[pk, k], 2)?, Tensor::cat(&[pv, v], 2)?),
            _ => (k.clone(), v.clone()),
        };
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    pub fn seq_len(&self) -> usize {
        self.k.as_ref().map(|k| k.dim(2).unwrap_or(0)).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Build `n` empty caches, one per layer.
pub fn new_caches(n: usize) -> Vec<KvCache> {
    (0..n).map(|_| KvCache::new()).collect()
}

/// Rotate-half rotary embedding with precomputed cos/sin tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate `[b, h, s, d]` queries and keys starting at position `offset`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?.to_dtype(q.dtype())?;
        let sin = self.sin.narrow(0, offset, seq_len)?.to_dtype(q.dtype())?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Additive causal mask `[1, 1, seq, offset + seq]`: zero where key
/// position `j <= offset + i`, `-inf` elsewhere.
pub fn causal_mask(seq_len: usize, offset: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let total = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j <= offset + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, total), device)?.to_dtype(dtype)?)
}

pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(dims: &LayerDims, vb: VarBuilder) -> Result<Self> {
        let h = dims.hidden_size;
        let (nh, nkv, hd) = (dims.num_attention_heads, dims.num_key_value_heads, dims.head_dim);
        let (q_norm, k_norm) = if dims.qk_norm {
            (
                Some(rms_norm(hd, dims.rms_norm_eps, vb.pp("q_norm"))?),
                Some(rms_norm(hd, dims.rms_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            q_proj: linear_no_bias(h, nh * hd, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(h, nkv * hd, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(h, nkv * hd, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(nh * hd, h, vb.pp("o_proj"))?,
            q_norm,
            k_norm,
            num_heads: nh,
            num_kv_heads: nkv,
            head_dim: hd,
            scale: 1.0 / (hd as f64).sqrt(),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        mask: Option<&Tensor>,
        cache: Option<&mut KvCache>,
        offset: usize,
    ) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?.reshape((b, s, self.num_heads, self.head_dim))?;
        let k = self.k_proj.forward(x)?.reshape((b, s, self.num_kv_heads, self.head_dim))?;
        let v = self.v_proj.forward(x)?.reshape((b, s, self.num_kv_heads, self.head_dim))?;

        let q = match &self.q_norm {
            Some(n) => n.forward(&q)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(n) => n.forward(&k)?,
            None => k,
        };

        let q = q.transpose(1, 2)?;
        let k = k.transpose(1, 2)?;
        let v = v.transpose(1, 2)?.contiguous()?;
        let (q, k) = rope.apply(&q, &k, offset)?;

        let (k, v) = match cache {
            Some(cache) => cache.update(&k, &v)?,
            None => (k, v),
        };

        #[cfg(feature = "flash-attn")]
        if q.device().is_cuda() && q.dtype() == DType::BF16 {
            // Flash kernel wants [b, s, h, d] and handles GQA and causality itself.
            let q = q.transpose(1, 2)?.contiguous()?;
            let k = k.transpose(1, 2)?.contiguous()?;
            let v = v.transpose(1, 2)?.contiguous()?;
            let out = flash_attn(&q, &k, &v, self.scale as f32, true)?;
            let out = out.reshape((b, s, self.num_heads * self.head_dim))?;
            return Ok(self.o_proj.forward(&out)?);
        }

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scores = (q.contiguous()?.matmul(&k.t()?)? * self.scale)?;
        let scores = match mask {
            Some(m) => scores.broadcast_add(m)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v)?;

        let out = out
            .transpose(1, 2)?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// SwiGLU feed-forward.
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(dims: &LayerDims, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (dims.hidden_size, dims.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Pre-norm decoder layer. The codec pre-transformer additionally scales
/// each residual branch by a learned per-channel vector.
pub struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    attn_layer_scale: Option<Tensor>,
    mlp_layer_scale: Option<Tensor>,
}

impl DecoderLayer {
    pub fn new(dims: &LayerDims, vb: VarBuilder) -> Result<Self> {
        Self::build(dims, false, vb)
    }

    pub fn with_layer_scale(dims: &LayerDims, vb: VarBuilder) -> Result<Self> {
        Self::build(dims, true, vb)
    }

    fn build(dims: &LayerDims, layer_scale: bool, vb: VarBuilder) -> Result<Self> {
        let h = dims.hidden_size;
        let (attn_layer_scale, mlp_layer_scale) = if layer_scale {
            (
                Some(vb.pp("self_attn_layer_scale").get(h, "scale")?),
                Some(vb.pp("mlp_layer_scale").get(h, "scale")?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            self_attn: Attention::new(dims, vb.pp("self_attn"))?,
            mlp: Mlp::new(dims, vb.pp("mlp"))?,
            input_layernorm: rms_norm(h, dims.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                h,
                dims.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            attn_layer_scale,
            mlp_layer_scale,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        mask: Option<&Tensor>,
        cache: Option<&mut KvCache>,
        offset: usize,
    ) -> Result<Tensor> {
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, rope, mask, cache, offset)?;
        let h = scale_branch(h, self.attn_layer_scale.as_ref())?;
        let x = (x + h)?;

        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        let h = scale_branch(h, self.mlp_layer_scale.as_ref())?;
        Ok((x + h)?)
    }
}

fn scale_branch(h: Tensor, scale: Option<&Tensor>) -> Result<Tensor> {
    match scale {
        Some(s) => Ok(h.broadcast_mul(&s.to_dtype(h.dtype())?)?),
        None => Ok(h),
    }
}

/// Run a layer stack over `x` at `offset`, one cache per layer.
pub fn run_layers(
    layers: &[DecoderLayer],
    x: &Tensor,
    rope: &RotaryEmbedding,
    mask: Option<&Tensor>,
    caches: &mut [KvCache],
    offset: usize,
) -> Result<Tensor> {
    let mut h = x.clone();
    for (layer, cache) in layers.iter().zip(caches.iter_mut()) {
        h = layer.forward(&h, rope, mask, Some(cache), offset)?;
    }
    Ok(h)
}

/// Mask for a forward of `seq_len` positions at `offset`; single-token
/// steps attend to the whole cache and need none.
pub fn step_mask(seq_len: usize, offset: usize, dtype: DType, device: &Device) -> Result<Option<Tensor>> {
    if seq_len <= 1 {
        Ok(None)
    } else {
        Ok(Some(causal_mask(seq_len, offset, dtype, device)?))
    }
}
