//! Mono waveform buffer plus WAV read/write.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::{Cursor, Seek, Write};
use std::path::Path;

/// Mono samples in `[-1.0, 1.0]` at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Write as 16-bit PCM mono WAV.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    /// Load any supported container (WAV, MP3), downmixed to mono.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        super::decode::load_audio(path)
    }

    /// Encode as an in-memory 16-bit PCM WAV file.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(44 + self.samples.len() * 2));
        write_pcm16(&mut cursor, &self.samples, self.sample_rate)?;
        Ok(cursor.into_inner())
    }
}

fn pcm16_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn write_pcm16<W: Write + Seek>(out: W, samples: &[f32], sample_rate: u32) -> Result<()> {
    let mut writer = WavWriter::new(out, pcm16_spec(sample_rate))?;
    for &s in samples {
        writer.write_sample(to_i16(s))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a WAV file, averaging channels down to mono.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    read_wav(reader)
}

fn read_wav<R: std::io::Read>(reader: WavReader<R>) -> Result<AudioBuffer> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Decode WAV bytes held in memory.
pub fn wav_from_bytes(bytes: &[u8]) -> Result<AudioBuffer> {
    let reader = WavReader::new(Cursor::new(bytes)).context("Invalid WAV data")?;
    read_wav(reader)
}

pub fn save_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    write_pcm16(std::io::BufWriter::new(file), samples, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_duration() {
        assert!((AudioBuffer::new(vec![0.0; 36000], 24000).duration() - 1.5).abs() < 1e-6);
        assert_eq!(AudioBuffer::new(vec![0.0; 10], 0).duration(), 0.0);
    }

    #[test]
    fn test_wav_bytes_header() {
        let audio = AudioBuffer::new(vec![0.0, 0.5, -0.5, 1.0], 24000);
        let bytes = audio.to_wav_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(bytes.len(), 44 + 8);

        let decoded = wav_from_bytes(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 24000);
        assert_eq!(decoded.len(), 4);
        assert!((decoded.samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_out_of_range_samples_are_clipped() {
        assert_eq!(to_i16(3.0), i16::MAX);
        assert_eq!(to_i16(-3.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
    }

    #[test]
    fn test_save_creates_parent_and_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("voices").join("ref.wav");
        AudioBuffer::new(vec![0.25; 480], 16000).save(&path).unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate, 16000);
        assert_eq!(loaded.len(), 480);
        assert!(loaded.samples.iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.len(), 100);
        assert!((loaded.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_wav("/nonexistent/voice.wav").is_err());
    }
}
