//! Compressed-audio decoding through symphonia (MP3 reference clips).

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;

use super::{load_wav, AudioBuffer};

/// Average all planes of a decoded packet into `out`.
fn downmix<T>(out: &mut Vec<f32>, buf: &symphonia::core::audio::AudioBuffer<T>)
where
    T: Sample,
    f32: FromSample<T>,
{
    let channels = buf.spec().channels.count().max(1);
    let start = out.len();
    out.extend(buf.chan(0).iter().map(|&v| f32::from_sample(v)));
    for ch in 1..channels {
        for (acc, &v) in out[start..].iter_mut().zip(buf.chan(ch)) {
            *acc += f32::from_sample(v);
        }
    }
    if channels > 1 {
        let scale = 1.0 / channels as f32;
        out[start..].iter_mut().for_each(|s| *s *= scale);
    }
}

/// Decode the first audio track of any container symphonia can probe.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Unrecognized audio format: {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No decodable audio track in {}", path.display()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate in {}", path.display()))?;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("Unsupported codec: {e}"))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        while !format.metadata().is_latest() {
            format.metadata().pop();
        }
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // corrupt frame; skip it
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::debug!(%msg, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match decoded {
            AudioBufferRef::F32(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::F64(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::U8(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::U16(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::U24(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::U32(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::S8(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::S16(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::S24(buf) => downmix(&mut samples, &buf),
            AudioBufferRef::S32(buf) => downmix(&mut samples, &buf),
        }
    }

    if samples.is_empty() {
        return Err(anyhow!("Audio file contains no samples: {}", path.display()));
    }
    Ok(AudioBuffer::new(samples, sample_rate))
}

/// Load a reference clip: WAV through hound, everything else through symphonia.
pub fn load_audio<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        load_wav(path)
    } else {
        decode_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wav_extension_uses_hound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.WAV");
        AudioBuffer::new(vec![0.1; 240], 24000).save(&path).unwrap();
        let audio = load_audio(&path).unwrap();
        assert_eq!(audio.len(), 240);
    }

    #[test]
    fn test_symphonia_reads_wav_without_extension() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("clip.wav");
        AudioBuffer::new(vec![0.5; 2400], 24000).save(&wav).unwrap();
        let renamed = dir.path().join("clip.audio");
        std::fs::rename(&wav, &renamed).unwrap();

        let audio = decode_file(&renamed).unwrap();
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.len(), 2400);
        assert!((audio.samples[100] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("noise.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(load_audio(&path).is_err());
    }
}
