//! Multi-token code predictor.
//!
//! Given the talker's hidden state and the embedding of the semantic code it
//! just sampled, predicts the remaining 15 acoustic codebooks of the frame
//! one group at a time with its own small transformer and a dedicated
//! embedding/head pair per group.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use super::config::CodePredictorConfig;
use super::transformer::{new_caches, run_layers, step_mask, DecoderLayer, RotaryEmbedding};

const MAX_SEQ_LEN: usize = 1024;

pub struct CodePredictor {
    codec_embeddings: Vec<Embedding>,
    projection: Option<Linear>,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_heads: Vec<Linear>,
    rope: RotaryEmbedding,
    device: Device,
    dtype: DType,
}

impl CodePredictor {
    /// `embed_dim` is the talker width; when it differs from the predictor
    /// width a `small_to_mtp_projection` bridges the two.
    pub fn new(config: &CodePredictorConfig, embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("talker").pp("code_predictor");
        let vb_m = vb.pp("model");
        let groups = config.num_code_groups - 1;
        let dims = config.layer_dims();

        let codec_embeddings = (0..groups)
            .map(|g| embedding(config.vocab_size, embed_dim, vb_m.pp("codec_embedding").pp(g)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let lm_heads = (0..groups)
            .map(|g| linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head").pp(g)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(&dims, vb_m.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let projection = if embed_dim != config.hidden_size {
            Some(linear(embed_dim, config.hidden_size, vb.pp("small_to_mtp_projection"))?)
        } else {
            None
        };

        Ok(Self {
            codec_embeddings,
            projection,
            layers,
            norm: rms_norm(config.hidden_size, config.rms_norm_eps, vb_m.pp("norm"))?,
            lm_heads,
            rope: RotaryEmbedding::new(config.head_dim, MAX_SEQ_LEN, config.rope_theta, vb.device())?,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn num_acoustic_groups(&self) -> usize {
        self.codec_embeddings.len()
    }

    fn project(&self, x: &Tensor) -> Result<Tensor> {
        match &self.projection {
            Some(p) => Ok(p.forward(x)?),
            None => Ok(x.clone()),
        }
    }

    fn argmax_last(&self, hidden: &Tensor, group: usize) -> Result<u32> {
        let last = hidden.i((0, hidden.dim(1)? - 1))?;
        let logits = self.lm_heads[group].forward(&last.unsqueeze(0)?)?;
        Ok(logits.to_dtype(DType::F32)?.argmax(D::Minus1)?.i(0)?.to_scalar::<u32>()?)
    }

    /// Greedily predict the 15 acoustic codes for one frame.
    ///
    /// `talker_hidden` and `semantic_embed` are both `[1, 1, embed_dim]`.
    pub fn predict(&self, talker_hidden: &Tensor, semantic_embed: &Tensor) -> Result<Vec<u32>> {
        let mut caches = new_caches(self.layers.len());
        let groups = self.num_acoustic_groups();
        let mut codes = Vec::with_capacity(groups);

        let prefix = Tensor::cat(&[talker_hidden, semantic_embed], 1)?;
        let prefix = self.project(&prefix)?;
        let mask = step_mask(2, 0, self.dtype, &self.device)?;
        let h = run_layers(&self.layers, &prefix, &self.rope, mask.as_ref(), &mut caches, 0)?;
        codes.push(self.argmax_last(&self.norm.forward(&h)?, 0)?);

        for g in 1..groups {
            let prev = Tensor::new(&[codes[g - 1]], &self.device)?;
            let x = self.codec_embeddings[g - 1].forward(&prev)?.unsqueeze(0)?;
            let x = self.project(&x)?;
            let h = run_layers(&self.layers, &x, &self.rope, None, &mut caches, g + 1)?;
            codes.push(self.argmax_last(&self.norm.forward(&h)?, g)?);
        }
        Ok(codes)
    }

    /// Embeddings `[1, T, embed_dim]` of acoustic group `group` (0-based) codes.
    pub fn embed_group(&self, group: usize, codes: &Tensor) -> Result<Tensor> {
        let codes = codes.to_dtype(DType::U32)?;
        Ok(self.codec_embeddings[group].forward(&codes)?.unsqueeze(0)?)
    }

    /// Sum of all acoustic-group embeddings for one frame, `[1, 1, embed_dim]`.
    pub fn embed_sum(&self, codes: &[u32]) -> Result<Tensor> {
        let mut sum: Option<Tensor> = None;
        for (g, &code) in codes.iter().enumerate() {
            let e = self.embed_group(g, &Tensor::new(&[code], &self.device)?)?;
            sum = Some(match sum {
                Some(s) => (s + e)?,
                None => e,
            });
        }
        match sum {
            Some(s) => Ok(s),
            None => anyhow::bail!("no acoustic codes to embed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny(embed_dim: usize) -> CodePredictor {
        let config = CodePredictorConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            head_dim: 4,
            vocab_size: 64,
            num_code_groups: 16,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        CodePredictor::new(&config, embed_dim, vb).unwrap()
    }

    #[test]
    fn test_predict_returns_fifteen_codes_in_range() {
        let cp = tiny(16);
        assert!(cp.projection.is_none());
        let h = Tensor::randn(0f32, 1.0, (1, 1, 16), &Device::Cpu).unwrap();
        let codes = cp.predict(&h, &h).unwrap();
        assert_eq!(codes.len(), 15);
        assert!(codes.iter().all(|&c| c < 64));
    }

    #[test]
    fn test_projection_bridges_wider_talker() {
        let cp = tiny(24);
        assert!(cp.projection.is_some());
        let h = Tensor::randn(0f32, 1.0, (1, 1, 24), &Device::Cpu).unwrap();
        let codes = cp.predict(&h, &h).unwrap();
        assert_eq!(codes.len(), 15);
        let sum = cp.embed_sum(&codes).unwrap();
        assert_eq!(sum.dims(), &[1, 1, 24]);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let cp = tiny(16);
        let h = Tensor::randn(0f32, 1.0, (1, 1, 16), &Device::Cpu).unwrap();
        assert_eq!(cp.predict(&h, &h).unwrap(), cp.predict(&h, &h).unwrap());
    }
}
