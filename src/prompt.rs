//! Precomputed voice-clone prompt and its on-disk cache.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Everything a cached prompt depends on: the checkpoint, the reference
/// clip as it was on disk, and its transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSource {
    pub model: String,
    pub ref_audio: String,
    pub ref_len: u64,
    /// Modification time in milliseconds since the epoch, when available
    pub ref_modified: Option<u64>,
    pub ref_text: Option<String>,
}

impl PromptSource {
    /// Describe `ref_audio` as it currently is on disk.
    pub fn describe(model: &str, ref_audio: &Path, ref_text: Option<&str>) -> Result<Self> {
        let meta = std::fs::metadata(ref_audio)
            .with_context(|| format!("Failed to stat {}", ref_audio.display()))?;
        let ref_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        Ok(Self {
            model: model.to_string(),
            ref_audio: ref_audio.display().to_string(),
            ref_len: meta.len(),
            ref_modified,
            ref_text: ref_text
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }
}

/// Everything synthesis needs from the reference voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceClonePrompt {
    pub source: PromptSource,
    /// x-vector from the speaker encoder
    pub speaker_embedding: Vec<f32>,
    /// `[T][16]` codec frames of the reference clip
    pub ref_codes: Option<Vec<Vec<u32>>>,
    /// Token ids of the reference transcript
    pub ref_text_ids: Option<Vec<u32>>,
}

impl VoiceClonePrompt {
    /// In-context cloning needs both the reference codes and transcript.
    pub fn is_icl(&self) -> bool {
        matches!((&self.ref_codes, &self.ref_text_ids), (Some(c), Some(t)) if !c.is_empty() && !t.is_empty())
    }

    /// Reject a prompt whose x-vector does not fit a talker of `hidden_size`.
    pub fn check_width(&self, hidden_size: usize) -> Result<()> {
        if self.speaker_embedding.len() != hidden_size {
            bail!(
                "speaker embedding has {} values, model expects {}",
                self.speaker_embedding.len(),
                hidden_size
            );
        }
        Ok(())
    }

    pub fn speaker_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.speaker_embedding, self.speaker_embedding.len(), device)?)
    }

    /// Read a cached prompt; fails if it was built from a different source.
    pub fn load_cache(path: &Path, expected: &PromptSource) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read prompt cache {}", path.display()))?;
        let prompt: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt prompt cache {}", path.display()))?;
        if &prompt.source != expected {
            bail!("prompt cache {} was built from a different reference", path.display());
        }
        if prompt.speaker_embedding.is_empty() {
            bail!("prompt cache {} has no speaker embedding", path.display());
        }
        Ok(prompt)
    }

    /// Write atomically: a temp file in the same directory is renamed over
    /// the target.
    pub fn save_cache(&self, path: &Path) -> Result<()> {
        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir,
            None => Path::new("."),
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to write prompt cache {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn source() -> PromptSource {
        PromptSource {
            model: "Qwen/Qwen3-TTS-12Hz-1.7B-Base".into(),
            ref_audio: "voices/ref.wav".into(),
            ref_len: 4096,
            ref_modified: Some(1_700_000_000_000),
            ref_text: Some("Hello there.".into()),
        }
    }

    fn prompt() -> VoiceClonePrompt {
        VoiceClonePrompt {
            source: source(),
            speaker_embedding: vec![0.5; 8],
            ref_codes: Some(vec![vec![1; 16]; 3]),
            ref_text_ids: Some(vec![9, 10]),
        }
    }

    #[test]
    fn test_icl_requires_codes_and_text() {
        assert!(prompt().is_icl());
        let mut p = prompt();
        p.ref_text_ids = None;
        assert!(!p.is_icl());
        let mut p = prompt();
        p.ref_codes = Some(Vec::new());
        assert!(!p.is_icl());
    }

    #[test]
    fn test_cache_restores_prompt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache/prompt.json");
        prompt().save_cache(&path).unwrap();

        let restored = VoiceClonePrompt::load_cache(&path, &source()).unwrap();
        assert_eq!(restored.speaker_embedding, vec![0.5; 8]);
        assert_eq!(restored.ref_codes.unwrap().len(), 3);
    }

    #[test]
    fn test_cache_from_other_reference_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompt.json");
        prompt().save_cache(&path).unwrap();
        let other = PromptSource {
            ref_text: None,
            ..source()
        };
        assert!(VoiceClonePrompt::load_cache(&path, &other).is_err());
    }

    #[test]
    fn test_cache_from_other_model_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompt.json");
        prompt().save_cache(&path).unwrap();
        let other = PromptSource {
            model: "Qwen/Qwen3-TTS-12Hz-0.6B-Base".into(),
            ..source()
        };
        assert!(VoiceClonePrompt::load_cache(&path, &other).is_err());
    }

    #[test]
    fn test_regenerated_reference_changes_source() {
        let dir = tempdir().unwrap();
        let clip = dir.path().join("ref.wav");
        std::fs::write(&clip, b"first take").unwrap();
        let before = PromptSource::describe("m", &clip, Some(" Hi. ")).unwrap();
        assert_eq!(before.ref_text.as_deref(), Some("Hi."));
        assert_eq!(before.ref_len, 10);

        std::fs::write(&clip, b"a much longer second take").unwrap();
        let after = PromptSource::describe("m", &clip, Some("Hi.")).unwrap();
        assert_ne!(before, after);
        assert!(PromptSource::describe("m", &dir.path().join("missing.wav"), None).is_err());
    }

    #[test]
    fn test_width_check() {
        let p = prompt();
        assert!(p.check_width(8).is_ok());
        let err = p.check_width(16).unwrap_err().to_string();
        assert!(err.contains("8 values"));
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompt.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(VoiceClonePrompt::load_cache(&path, &source()).is_err());
    }

    #[test]
    fn test_speaker_tensor_shape() {
        let t = prompt().speaker_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[8]);
    }
}
