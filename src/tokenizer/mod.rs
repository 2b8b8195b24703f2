//! Text tokenization (Qwen2 vocabulary) through HuggingFace `tokenizers`.

mod text;

pub use text::TextTokenizer;
