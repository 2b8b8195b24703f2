//! Qwen2 byte-level BPE tokenizer.

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use tokenizers::Tokenizer;

/// Split pattern of the Qwen2 pre-tokenizer.
const PRETOKENIZE_REGEX: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

pub struct TextTokenizer {
    tokenizer: Tokenizer,
}

impl std::fmt::Debug for TextTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

impl TextTokenizer {
    /// Load from a `tokenizer.json` file, a checkpoint directory, or (with
    /// the `hub` feature) a hub repo id.
    ///
    /// Directories are tried for `tokenizer.json` first, then for
    /// `vocab.json` + `merges.txt`.
    pub fn from_pretrained(source: &str) -> Result<Self> {
        let path = Path::new(source);
        if path.is_file() {
            return Self::from_file(path);
        }
        if path.is_dir() {
            return Self::from_dir(path);
        }
        let dir = crate::hub::resolve_model_dir(source)?;
        Self::from_dir(&dir)
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        let json = dir.join("tokenizer.json");
        if json.is_file() {
            return Self::from_file(json);
        }
        if dir.join("vocab.json").is_file() && dir.join("merges.txt").is_file() {
            tracing::info!(dir = %dir.display(), "building tokenizer from vocab.json + merges.txt");
            return Self::from_vocab_and_merges(dir);
        }
        bail!(
            "No tokenizer files found in '{}'. Expected tokenizer.json or vocab.json + merges.txt.",
            dir.display()
        )
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Assemble the Qwen2 pipeline: NFC, regex split + byte-level
    /// pre-tokenization, BPE, byte-level decoding.
    pub fn from_vocab_and_merges(dir: &Path) -> Result<Self> {
        use tokenizers::models::bpe::BPE;
        use tokenizers::normalizers::unicode::NFC;
        use tokenizers::pre_tokenizers::byte_level::ByteLevel;
        use tokenizers::pre_tokenizers::sequence::Sequence;
        use tokenizers::pre_tokenizers::split::Split;
        use tokenizers::SplitDelimiterBehavior;

        let vocab = dir.join("vocab.json");
        let merges = dir.join("merges.txt");
        let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
            .unk_token("<|endoftext|>".to_string())
            .build()
            .map_err(|e| anyhow!("Failed to build BPE from {}: {}", dir.display(), e))?;

        let split = Split::new(PRETOKENIZE_REGEX, SplitDelimiterBehavior::Isolated, false)
            .map_err(|e| anyhow!("Invalid pre-tokenizer pattern: {}", e))?;
        let byte_level = || ByteLevel::new(false, false, false);

        let mut tokenizer = Tokenizer::new(bpe);
        tokenizer.with_normalizer(Some(NFC));
        tokenizer.with_pre_tokenizer(Some(Sequence::new(vec![split.into(), byte_level().into()])));
        tokenizer.with_post_processor(Some(byte_level()));
        tokenizer.with_decoder(Some(byte_level()));

        let config = dir.join("tokenizer_config.json");
        if config.is_file() {
            register_special_tokens(&mut tokenizer, &config)?;
        }
        Ok(Self::from_tokenizer(tokenizer))
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Token ids of `text` with no special tokens added.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// A voice description as a user chat turn.
    pub fn encode_instruct(&self, instruct: &str) -> Result<Vec<u32>> {
        if instruct.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.encode(&format!("<|im_start|>user\n{instruct}<|im_end|>\n"))
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow!("Failed to decode tokens: {}", e))
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }
}

/// Register every `special: true` entry of `added_tokens_decoder`.
fn register_special_tokens(tokenizer: &mut Tokenizer, path: &Path) -> Result<()> {
    use tokenizers::AddedToken;

    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
    let config: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| anyhow!("Failed to parse {}: {}", path.display(), e))?;

    let Some(entries) = config.get("added_tokens_decoder").and_then(|v| v.as_object()) else {
        return Ok(());
    };
    let flag = |info: &serde_json::Value, key: &str| info.get(key).and_then(|v| v.as_bool());

    let tokens: Vec<AddedToken> = entries
        .values()
        .filter(|info| flag(info, "special").unwrap_or(false))
        .filter_map(|info| {
            let content = info.get("content")?.as_str()?;
            Some(
                AddedToken::from(content, true)
                    .lstrip(flag(info, "lstrip").unwrap_or(false))
                    .rstrip(flag(info, "rstrip").unwrap_or(false))
                    .normalized(flag(info, "normalized").unwrap_or(false))
                    .single_word(flag(info, "single_word").unwrap_or(false)),
            )
        })
        .collect();

    if !tokens.is_empty() {
        tracing::debug!(count = tokens.len(), "registering special tokens");
        tokenizer.add_special_tokens(&tokens);
    }
    Ok(())
}
