//! Name-addressed access to a loaded safetensors map.
//!
//! The codec checkpoint stores tensors whose shapes are easiest to read off
//! the file itself (kernel sizes, derived codebooks), so those modules take
//! weights by name instead of declaring shapes up front through a
//! `VarBuilder`.

use anyhow::{anyhow, Result};
use candle_core::Tensor;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Weights {
    tensors: Arc<HashMap<String, Tensor>>,
    prefix: String,
}

impl Weights {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors: Arc::new(tensors),
            prefix: String::new(),
        }
    }

    /// Scope to `prefix.`, like `VarBuilder::pp`.
    pub fn pp<S: ToString>(&self, name: S) -> Self {
        Self {
            tensors: self.tensors.clone(),
            prefix: self.key(&name.to_string()),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    pub fn get(&self, name: &str) -> Result<Tensor> {
        let key = self.key(name);
        self.tensors
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("missing weight: {}", key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(&self.key(name))
    }

    /// True if any tensor lives under the current prefix.
    pub fn has_prefix(&self) -> bool {
        let p = format!("{}.", self.prefix);
        self.tensors.keys().any(|k| k.starts_with(&p))
    }
}

/// Collect the tensors under `prefix`, with the prefix removed.
pub fn strip_prefix(tensors: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|s| (s.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample() -> HashMap<String, Tensor> {
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let mut map = HashMap::new();
        map.insert("decoder.pre_conv.conv.weight".to_string(), t.clone());
        map.insert("encoder.downsample.conv.weight".to_string(), t);
        map
    }

    #[test]
    fn test_scoped_lookup() {
        let w = Weights::new(sample());
        let conv = w.pp("decoder").pp("pre_conv").pp("conv");
        assert!(conv.get("weight").is_ok());
        assert!(conv.contains("weight"));
        let err = conv.get("bias").unwrap_err().to_string();
        assert!(err.contains("decoder.pre_conv.conv.bias"));
        assert!(w.pp("decoder").has_prefix());
        assert!(!w.pp("speaker_encoder").has_prefix());
    }

    #[test]
    fn test_strip_prefix() {
        let stripped = strip_prefix(&sample(), "encoder.");
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("downsample.conv.weight"));
    }
}
