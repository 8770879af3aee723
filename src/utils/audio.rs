use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::process::Command;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Mono PCM audio, samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn silent(duration_ms: u64, sample_rate: u32) -> Self {
        Self::new(vec![0.0; ms_to_samples(duration_ms, sample_rate)], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        samples_to_ms(self.samples.len(), self.sample_rate)
    }
}

pub fn ms_to_samples(ms: u64, sample_rate: u32) -> usize {
    (ms * sample_rate as u64 / 1000) as usize
}

pub fn samples_to_ms(samples: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    samples as u64 * 1000 / sample_rate as u64
}

/// Linear amplitude factor for a gain in decibels.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub fn apply_gain(samples: &mut [f32], db: f32) {
    let gain = db_to_gain(db);
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// RMS level of `samples` in dBFS; `-inf` for digital silence.
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    if mean_square <= 0.0 {
        return f32::NEG_INFINITY;
    }
    10.0 * mean_square.log10()
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Decodes an in-memory WAV file, mixing all channels down to mono.
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<AudioSegment> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).context("Invalid WAV data")?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read WAV samples")?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read WAV samples")?
        }
    };
    Ok(AudioSegment::new(
        downmix(&interleaved, spec.channels as usize),
        spec.sample_rate,
    ))
}

/// Encodes mono audio as 16-bit PCM WAV.
pub fn encode_wav(segment: &AudioSegment) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: segment.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec)?;
        for s in &segment.samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(buf)
}

/// Decodes any container symphonia understands (MP3, WAV) to mono.
pub fn decode_file(path: &Path) -> Result<AudioSegment> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("Unsupported audio format: {:?}", path))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No audio track in {:?}", path))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(44100);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Failed to create decoder")?;

    let mut samples = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend(downmix(buf.samples(), spec.channels.count()));
            }
            Err(e) => {
                warn!("Skipping undecodable packet in {:?}: {}", path, e);
                continue;
            }
        }
    }

    debug!("Decoded {} samples at {} Hz from {:?}", samples.len(), sample_rate, path);
    Ok(AudioSegment::new(samples, sample_rate))
}

const RESAMPLE_CHUNK: usize = 1024;
const SINC_LEN: usize = 128;

/// Resamples to `target_rate`. Output length is `len * target / source`, rounded.
pub fn resample(segment: &AudioSegment, target_rate: u32) -> Result<AudioSegment> {
    if segment.sample_rate == target_rate || segment.is_empty() {
        return Ok(AudioSegment::new(segment.samples.clone(), target_rate));
    }

    let ratio = target_rate as f64 / segment.sample_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| anyhow!("Failed to initialise resampler: {}", e))?;

    let expected = (segment.len() as f64 * ratio).round() as usize;
    // One extra chunk flushes the filter delay.
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK * 2);
    let padded_len = segment.len().div_ceil(RESAMPLE_CHUNK) * RESAMPLE_CHUNK + RESAMPLE_CHUNK;
    let mut chunk = vec![0.0f32; RESAMPLE_CHUNK];
    for start in (0..padded_len).step_by(RESAMPLE_CHUNK) {
        chunk.fill(0.0);
        if start < segment.len() {
            let end = (start + RESAMPLE_CHUNK).min(segment.len());
            chunk[..end - start].copy_from_slice(&segment.samples[start..end]);
        }
        let frames = resampler
            .process(&[&chunk[..]], None)
            .map_err(|e| anyhow!("Resampling failed: {}", e))?;
        output.extend_from_slice(&frames[0]);
    }

    let mut samples: Vec<f32> = output.into_iter().skip(delay).take(expected).collect();
    samples.resize(expected, 0.0);
    Ok(AudioSegment::new(samples, target_rate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp3,
    Wav,
}

fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args(args)
        .output()
        .context("Failed to run ffmpeg. Is it installed?")?;
    if !output.status.success() {
        return Err(anyhow!(
            "ffmpeg failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Writes `segment` to `path`. The file appears at `path` only once it is complete.
pub fn export(segment: &AudioSegment, path: &Path, format: OutputFormat) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let wav = encode_wav(segment)?;
    let staged = match format {
        OutputFormat::Wav => {
            let mut tmp = tempfile::Builder::new().suffix(".wav").tempfile_in(dir)?;
            std::io::Write::write_all(&mut tmp, &wav)?;
            tmp
        }
        OutputFormat::Mp3 => {
            let mut source = tempfile::Builder::new().suffix(".wav").tempfile_in(dir)?;
            std::io::Write::write_all(&mut source, &wav)?;
            let target = tempfile::Builder::new().suffix(".mp3").tempfile_in(dir)?;
            run_ffmpeg(&[
                "-y",
                "-loglevel",
                "error",
                "-i",
                &source.path().to_string_lossy(),
                "-c:a",
                "libmp3lame",
                "-q:a",
                "2",
                &target.path().to_string_lossy(),
            ])?;
            target
        }
    };

    staged
        .persist(path)
        .map_err(|e| anyhow!("Failed to move export into place at {:?}: {}", path, e.error))?;
    info!("Exported {} ms of audio to {:?}", segment.duration_ms(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, ms: u64, rate: u32) -> AudioSegment {
        let n = ms_to_samples(ms, rate);
        let samples = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect();
        AudioSegment::new(samples, rate)
    }

    #[test]
    fn test_db_to_gain() {
        assert!((db_to_gain(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_gain(-20.0) - 0.1).abs() < 1e-6);
        assert!((db_to_gain(-6.0) - 0.501).abs() < 1e-3);

        let mut samples = vec![0.5, -0.5];
        apply_gain(&mut samples, -20.0);
        assert!((samples[0] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_rms_dbfs() {
        assert_eq!(rms_dbfs(&[0.0; 10]), f32::NEG_INFINITY);
        assert!((rms_dbfs(&[1.0; 10])).abs() < 1e-6);
        assert!((rms_dbfs(&[0.1; 10]) + 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_wav_encode_decode() -> Result<()> {
        let original = sine(440.0, 50, 16000);
        let decoded = decode_wav_bytes(&encode_wav(&original)?)?;

        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.samples.iter().zip(&decoded.samples) {
            assert!((a - b).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_stereo_wav_is_downmixed() -> Result<()> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut buf = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec)?;
            for _ in 0..4 {
                writer.write_sample(1.0f32)?;
                writer.write_sample(0.0f32)?;
            }
            writer.finalize()?;
        }

        let decoded = decode_wav_bytes(&buf)?;
        assert_eq!(decoded.samples, vec![0.5; 4]);
        Ok(())
    }

    #[test]
    fn test_decode_file_reads_wav() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, encode_wav(&sine(220.0, 100, 22050))?)?;

        let decoded = decode_file(&path)?;
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.len(), ms_to_samples(100, 22050));
        Ok(())
    }

    #[test]
    fn test_resample_length() -> Result<()> {
        let input = sine(440.0, 1000, 22050);
        let output = resample(&input, 44100)?;
        assert_eq!(output.sample_rate, 44100);
        assert_eq!(output.len(), 44100);

        let down = resample(&input, 16000)?;
        assert_eq!(down.len(), 16000);
        let peak = down.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.3 && peak < 0.7);
        Ok(())
    }

    #[test]
    fn test_resample_keeps_onset_position() -> Result<()> {
        let mut samples = vec![0.0f32; 400];
        samples.extend((0..400).map(|i| 0.5 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 8000.0).sin()));
        let output = resample(&AudioSegment::new(samples, 8000), 16000)?;

        let before = output.samples[..780].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let after = output.samples[820..900].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(before < 0.05, "leading silence reached {}", before);
        assert!(after > 0.3, "onset peak was {}", after);
        Ok(())
    }

    #[test]
    fn test_export_wav_is_atomic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out").join("book.wav");

        export(&sine(440.0, 200, 8000), &path, OutputFormat::Wav)?;

        let decoded = decode_wav_bytes(&std::fs::read(&path)?)?;
        assert_eq!(decoded.len(), 1600);
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())?.collect();
        assert_eq!(leftovers.len(), 1);
        Ok(())
    }
}
