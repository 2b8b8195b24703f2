use std::path::PathBuf;

use clap::Parser;
use monitalk_tts::logging::{init_logging, LogFormat};
use monitalk_tts::server::{self, ServerConfig};

/// Voice-cloning TTS sidecar.
#[derive(Debug, Parser)]
#[command(name = "monitalk-tts-serve", version, about)]
struct Args {
    #[arg(long, env = "TTS_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "TTS_PORT", default_value_t = 8880)]
    port: u16,

    /// Checkpoint directory or hub repo id
    #[arg(long, env = "TTS_MODEL", default_value = "Qwen/Qwen3-TTS-12Hz-1.7B-Base")]
    model: String,

    /// Tokenizer file or directory; defaults to the model directory
    #[arg(long, env = "TTS_TOKENIZER")]
    tokenizer: Option<String>,

    #[arg(long, env = "TTS_REF_AUDIO", default_value = "voices/monika.mp3")]
    ref_audio: PathBuf,

    /// Transcript of the reference clip; empty for x-vector-only cloning
    #[arg(
        long,
        env = "TTS_REF_TEXT",
        default_value = "Hey, it's me, Monika! How are you doing today?"
    )]
    ref_text: String,

    /// auto, cpu, cuda, cuda:N or metal
    #[arg(long, env = "TTS_DEVICE", default_value = "auto")]
    device: String,

    /// Where to keep the computed voice prompt between restarts
    #[arg(long, env = "TTS_PROMPT_CACHE")]
    prompt_cache: Option<PathBuf>,

    #[arg(long)]
    no_warmup: bool,

    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let ref_text = Some(args.ref_text).filter(|t| !t.trim().is_empty());
        Self {
            host: args.host,
            port: args.port,
            model: args.model,
            tokenizer: args.tokenizer,
            ref_audio: args.ref_audio,
            ref_text,
            device: args.device,
            prompt_cache: args.prompt_cache,
            warmup: !args.no_warmup,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging("info", args.log_format);

    let config = ServerConfig::from(args);
    tracing::debug!(?config, "configuration");
    server::run(config).await
}
