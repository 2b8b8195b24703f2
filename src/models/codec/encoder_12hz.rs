//! Speech-token encoder used to turn the reference clip into codec frames
//! for in-context cloning.
//!
//! The checkpoint's encoder half is a stock Mimi encoder, so it is assembled
//! from candle-transformers' `mimi` components: SEANet, a projected
//! streaming transformer, a learnt 25 Hz to 12.5 Hz downsample and the split
//! residual quantizer (16 codebooks).

use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, StreamingModule, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::mimi;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::models::weights::strip_prefix;

pub const NUM_CODEBOOKS: usize = 16;

pub struct Encoder12Hz {
    seanet: mimi::seanet::SeaNetEncoder,
    // forward/reset_state take &mut self
    transformer: RefCell<mimi::transformer::ProjectedTransformer>,
    downsample: mimi::conv::ConvDownsample1d,
    quantizer: mimi::quantization::SplitResidualVectorQuantizer,
    device: Device,
}

impl Encoder12Hz {
    /// True when the speech-tokenizer checkpoint ships encoder weights.
    pub fn is_present(tensors: &HashMap<String, Tensor>) -> bool {
        tensors.keys().any(|k| k.starts_with("encoder."))
    }

    pub fn from_weights(tensors: &HashMap<String, Tensor>, device: &Device) -> Result<Self> {
        let tensors = strip_prefix(tensors, "encoder.");
        if tensors.is_empty() {
            bail!("speech tokenizer has no encoder weights");
        }

        let cfg = mimi::Config::v0_1(Some(NUM_CODEBOOKS));
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let dim = cfg.seanet.dimension;

        let seanet = mimi::seanet::SeaNetEncoder::new(&cfg.seanet, vb.pp("encoder"))?;
        let transformer = mimi::transformer::ProjectedTransformer::new(
            dim,
            &[dim],
            &cfg.transformer,
            vb.pp("encoder_transformer"),
        )?;
        let seanet_rate = cfg.sample_rate / cfg.seanet.ratios.iter().product::<usize>() as f64;
        let downsample = mimi::conv::ConvDownsample1d::new(
            (seanet_rate / cfg.frame_rate) as usize,
            dim,
            true,
            true,
            vb.pp("downsample"),
        )?;
        let quantizer = mimi::quantization::SplitResidualVectorQuantizer::new(
            cfg.quantizer_dim,
            Some(dim),
            Some(dim),
            cfg.quantizer_n_q,
            cfg.quantizer_bins,
            vb.pp("quantizer"),
        )?;

        Ok(Self {
            seanet,
            transformer: RefCell::new(transformer),
            downsample,
            quantizer,
            device: device.clone(),
        })
    }

    /// Encode 24 kHz mono samples into `[T][16]` codec frames.
    pub fn encode(&self, samples: &[f32]) -> Result<Vec<Vec<u32>>> {
        if samples.is_empty() {
            bail!("cannot encode empty audio");
        }
        let input = Tensor::from_slice(samples, (1, 1, samples.len()), &self.device)?;
        let xs = self.seanet.forward(&input)?;

        let xs = {
            let mut transformer = self.transformer.borrow_mut();
            transformer.reset_state();
            let mut outs = transformer.forward(&xs)?;
            if outs.is_empty() {
                bail!("encoder transformer produced no output");
            }
            outs.swap_remove(0)
        };

        let xs = self.downsample.forward(&xs)?;
        // [1, 16, T] -> [T, 16]
        let codes = self.quantizer.encode(&xs)?.squeeze(0)?.t()?.to_dtype(DType::U32)?;
        Ok(codes.to_vec2::<u32>()?)
    }
}
