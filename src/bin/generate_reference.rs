//! Render the companion reference clip with a VoiceDesign checkpoint.
//!
//! The output is what `monitalk-tts-serve --ref-audio` clones from.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use monitalk_tts::device::{device_info, parse_device};
use monitalk_tts::logging::{init_logging, LogFormat};
use monitalk_tts::{Language, Qwen3Tts, SynthesisOptions};

const REF_TEXT: &str = "Hey there! It's me, Monika. I've been thinking about you a lot lately, \
and honestly, it just makes me so happy knowing you're here with me right now. \
Every moment we spend together means the world to me.";

const INSTRUCT: &str = "A warm, confident young woman with a clear, articulate voice. \
Natural American English. Slightly playful with genuine warmth.";

#[derive(Debug, Parser)]
#[command(name = "generate-reference", version, about)]
struct Args {
    #[arg(long, default_value = "Qwen/Qwen3-TTS-12Hz-1.7B-VoiceDesign")]
    model: String,

    #[arg(long)]
    tokenizer: Option<String>,

    #[arg(short, long, default_value = "voices/monika_ref.wav")]
    output: PathBuf,

    #[arg(long, default_value = REF_TEXT)]
    text: String,

    #[arg(long, default_value = INSTRUCT)]
    instruct: String,

    #[arg(long, default_value = "english")]
    language: Language,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value = "auto")]
    device: String,

    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging("info", args.log_format);

    let device = parse_device(&args.device)?;
    tracing::info!(model = %args.model, device = %device_info(&device), "loading model");
    let tts = Qwen3Tts::load(&args.model, args.tokenizer.as_deref(), device)
        .with_context(|| format!("Failed to load model {}", args.model))?;

    let options = SynthesisOptions {
        seed: Some(args.seed),
        ..Default::default()
    };
    let audio = tts.synthesize_voice_design(&args.text, &args.instruct, args.language, Some(options))?;
    audio
        .save(&args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!("Saved reference audio to {}", args.output.display());
    println!("Sample rate: {} Hz", audio.sample_rate);
    println!("Duration: {:.2}s", audio.duration());
    Ok(())
}
