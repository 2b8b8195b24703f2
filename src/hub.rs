//! Model-directory resolution, with HuggingFace Hub download behind the
//! `hub` feature.
//!
//! A checkpoint directory holds `config.json`, `model.safetensors` and the
//! text tokenizer files, plus a `speech_tokenizer/` subdirectory with the
//! codec weights.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Files fetched for a model id. Tokenizer files are optional per repo.
const MODEL_FILES: &[&str] = &["config.json", "model.safetensors"];
const OPTIONAL_FILES: &[&str] = &[
    "tokenizer.json",
    "vocab.json",
    "merges.txt",
    "tokenizer_config.json",
    "speech_tokenizer/config.json",
    "speech_tokenizer/model.safetensors",
];

/// Local paths of one checkpoint.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub weights: PathBuf,
    pub speech_weights: PathBuf,
}

impl ModelPaths {
    /// Lay out paths under a local checkpoint directory.
    ///
    /// The speech tokenizer lives in `speech_tokenizer/`; a flat checkpoint
    /// with the codec next to the talker is not supported, but a
    /// `speech_tokenizer/` beside the directory is.
    pub fn from_dir(root: &Path) -> Result<Self> {
        let config = root.join("config.json");
        let weights = root.join("model.safetensors");
        for f in [&config, &weights] {
            if !f.exists() {
                bail!("Missing model file: {}", f.display());
            }
        }
        let speech_weights = [
            root.join("speech_tokenizer").join("model.safetensors"),
            root.parent()
                .map(|p| p.join("speech_tokenizer").join("model.safetensors"))
                .unwrap_or_default(),
        ]
        .into_iter()
        .find(|p| p.is_file())
        .with_context(|| format!("No speech_tokenizer/model.safetensors found for {}", root.display()))?;

        Ok(Self {
            root: root.to_path_buf(),
            config,
            weights,
            speech_weights,
        })
    }
}

/// Resolve `model` to a local directory: an existing path is used as-is,
/// anything else is treated as a hub repo id.
pub fn resolve_model_dir(model: &str) -> Result<PathBuf> {
    let path = Path::new(model);
    if path.is_dir() {
        return Ok(path.to_path_buf());
    }
    if path.exists() {
        bail!("Model path is not a directory: {}", model);
    }
    download(model)
}

#[cfg(feature = "hub")]
fn download(model_id: &str) -> Result<PathBuf> {
    use hf_hub::api::sync::Api;

    tracing::info!(model = model_id, "downloading from HuggingFace Hub");
    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = api.model(model_id.to_string());

    let mut root = None;
    for file in MODEL_FILES {
        let local = repo
            .get(file)
            .with_context(|| format!("Failed to download {file} from {model_id}"))?;
        root.get_or_insert_with(|| local.parent().map(Path::to_path_buf).unwrap_or_default());
    }
    for file in OPTIONAL_FILES {
        if let Err(e) = repo.get(file) {
            tracing::debug!(file, error = %e, "optional file not fetched");
        }
    }
    root.context("empty model file list")
}

#[cfg(not(feature = "hub"))]
fn download(model_id: &str) -> Result<PathBuf> {
    bail!("Model '{}' is not a local directory and the hub feature is disabled", model_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"{}").unwrap();
    }

    #[test]
    fn test_local_dir_is_used_as_is() {
        let dir = tempdir().unwrap();
        let resolved = resolve_model_dir(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn test_file_path_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.json");
        touch(&file);
        assert!(resolve_model_dir(file.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_paths_with_nested_speech_tokenizer() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("config.json"));
        touch(&dir.path().join("model.safetensors"));
        touch(&dir.path().join("speech_tokenizer/model.safetensors"));
        let paths = ModelPaths::from_dir(dir.path()).unwrap();
        assert!(paths.speech_weights.starts_with(dir.path()));
    }

    #[test]
    fn test_paths_fall_back_to_sibling_speech_tokenizer() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("base");
        touch(&model.join("config.json"));
        touch(&model.join("model.safetensors"));
        touch(&dir.path().join("speech_tokenizer/model.safetensors"));
        let paths = ModelPaths::from_dir(&model).unwrap();
        assert_eq!(paths.speech_weights, dir.path().join("speech_tokenizer/model.safetensors"));
    }

    #[test]
    fn test_missing_weights_error() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("config.json"));
        let err = ModelPaths::from_dir(dir.path()).unwrap_err().to_string();
        assert!(err.contains("model.safetensors"));
    }
}
