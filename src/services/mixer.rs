use crate::core::error::PipelineError;
use crate::utils::audio::{db_to_gain, ms_to_samples, resample, rms_dbfs, AudioSegment};
use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuckingConfig {
    /// Background gain under speech.
    pub speech_duck_db: f32,
    /// Background gain between lines.
    pub silence_duck_db: f32,
    pub silence_thresh_db: f32,
    pub min_silence_ms: u64,
    pub fade_ms: u64,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            speech_duck_db: -20.0,
            silence_duck_db: -11.0,
            silence_thresh_db: -40.0,
            min_silence_ms: 500,
            fade_ms: 200,
        }
    }
}

/// Half-open `[start_ms, end_ms)` range of narration that is not silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechInterval {
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Joins line clips in order. Clips at a different rate than the first are resampled.
pub fn concatenate(segments: &[AudioSegment]) -> Result<AudioSegment, PipelineError> {
    let first = segments
        .first()
        .ok_or_else(|| PipelineError::Assembly("no speech segments were synthesized".into()))?;
    let rate = first.sample_rate;

    let mut samples = Vec::with_capacity(segments.iter().map(AudioSegment::len).sum());
    for segment in segments {
        if segment.sample_rate == rate {
            samples.extend_from_slice(&segment.samples);
        } else {
            let converted = resample(segment, rate)
                .map_err(|e| PipelineError::Assembly(format!("{:#}", e)))?;
            samples.extend(converted.samples);
        }
    }

    debug!("Concatenated {} segments into {} samples", segments.len(), samples.len());
    Ok(AudioSegment::new(samples, rate))
}

/// Finds non-silent stretches using 1 ms RMS frames. Quiet gaps shorter than
/// `min_silence_ms` do not split an interval.
pub fn detect_speech_intervals(
    track: &AudioSegment,
    silence_thresh_db: f32,
    min_silence_ms: u64,
) -> Vec<SpeechInterval> {
    let frame = ms_to_samples(1, track.sample_rate).max(1);
    let loud: Vec<bool> = track
        .samples
        .chunks(frame)
        .map(|chunk| rms_dbfs(chunk) > silence_thresh_db)
        .collect();

    let mut intervals: Vec<SpeechInterval> = Vec::new();
    let mut run_start: Option<usize> = None;
    for (ms, &is_loud) in loud.iter().enumerate() {
        match (is_loud, run_start) {
            (true, None) => run_start = Some(ms),
            (false, Some(start)) => {
                push_run(&mut intervals, start as u64, ms as u64, min_silence_ms);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        push_run(&mut intervals, start as u64, loud.len() as u64, min_silence_ms);
    }
    intervals
}

fn push_run(intervals: &mut Vec<SpeechInterval>, start_ms: u64, end_ms: u64, min_silence_ms: u64) {
    if let Some(last) = intervals.last_mut() {
        if start_ms - last.end_ms < min_silence_ms {
            last.end_ms = end_ms;
            return;
        }
    }
    intervals.push(SpeechInterval { start_ms, end_ms });
}

pub fn loop_to_length(bgm: &[f32], len: usize) -> Vec<f32> {
    if bgm.is_empty() {
        return vec![0.0; len];
    }
    bgm.iter().copied().cycle().take(len).collect()
}

/// Per-sample weight of the quiet copy: 0 = loud bed, 1 = fully ducked.
fn duck_mask(
    intervals: &[SpeechInterval],
    len: usize,
    sample_rate: u32,
    fade_ms: u64,
) -> Vec<f32> {
    let mut mask = vec![0.0f32; len];
    let fade = ms_to_samples(fade_ms, sample_rate);
    let half_fade_ms = fade_ms / 2;

    for interval in intervals {
        let start = ms_to_samples(interval.start_ms.saturating_sub(half_fade_ms), sample_rate);
        let end = ms_to_samples(interval.end_ms + half_fade_ms, sample_rate).min(len);
        if start >= end {
            continue;
        }
        for (i, weight) in mask.iter_mut().enumerate().take(end).skip(start) {
            let fade_in = if start == 0 || fade == 0 {
                1.0
            } else {
                ((i - start + 1) as f32 / fade as f32).min(1.0)
            };
            let fade_out = if end == len || fade == 0 {
                1.0
            } else {
                ((end - i) as f32 / fade as f32).min(1.0)
            };
            *weight = weight.max(fade_in.min(fade_out));
        }
    }
    mask
}

/// Output has the narration's length and sample rate.
pub fn mix(
    narration: &AudioSegment,
    bgm: &AudioSegment,
    config: &DuckingConfig,
) -> Result<AudioSegment, PipelineError> {
    if narration.is_empty() {
        return Ok(narration.clone());
    }
    if bgm.is_empty() {
        return Err(PipelineError::Mix("background track is empty".into()));
    }

    let bgm = resample(bgm, narration.sample_rate).map_err(|e| PipelineError::Mix(format!("{:#}", e)))?;
    let bed = loop_to_length(&bgm.samples, narration.len());

    let quiet = db_to_gain(config.speech_duck_db);
    let loud = db_to_gain(config.silence_duck_db);

    let intervals =
        detect_speech_intervals(narration, config.silence_thresh_db, config.min_silence_ms);
    info!(
        "Ducking background under {} speech interval(s), {} ms fades",
        intervals.len(),
        config.fade_ms
    );
    let mask = duck_mask(&intervals, narration.len(), narration.sample_rate, config.fade_ms);

    let samples = narration
        .samples
        .iter()
        .zip(bed.iter().zip(mask.iter()))
        .map(|(voice, (music, m))| {
            let gain = loud * (1.0 - m) + quiet * m;
            (voice + music * gain).clamp(-1.0, 1.0)
        })
        .collect();

    Ok(AudioSegment::new(samples, narration.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 8000;

    fn constant(value: f32, ms: u64) -> AudioSegment {
        AudioSegment::new(vec![value; ms_to_samples(ms, RATE)], RATE)
    }

    fn join(parts: &[AudioSegment]) -> AudioSegment {
        concatenate(parts).unwrap()
    }

    #[test]
    fn test_concatenate_keeps_order() {
        let a = AudioSegment::new(vec![0.1, 0.2], RATE);
        let b = AudioSegment::new(vec![0.3], RATE);
        let joined = join(&[a, b]);
        assert_eq!(joined.samples, vec![0.1, 0.2, 0.3]);
        assert_eq!(joined.sample_rate, RATE);
    }

    #[test]
    fn test_concatenate_empty_is_assembly_error() {
        assert!(matches!(concatenate(&[]), Err(PipelineError::Assembly(_))));
    }

    #[test]
    fn test_concatenate_resamples_mismatched_rates() {
        let a = constant(0.1, 100);
        let b = AudioSegment::new(vec![0.2; 1600], 16000);
        let joined = join(&[a, b]);
        assert_eq!(joined.len(), 800 + 800);
    }

    #[test]
    fn test_loop_to_length() {
        let bgm = vec![1.0, 2.0, 3.0];
        assert_eq!(loop_to_length(&bgm, 7), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 1.0]);
        assert_eq!(loop_to_length(&bgm, 2), vec![1.0, 2.0]);
        assert_eq!(loop_to_length(&[], 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_detect_speech_intervals() {
        let track = join(&[
            constant(0.0, 100),
            constant(0.5, 300),
            constant(0.0, 200),
            constant(0.5, 100),
            constant(0.0, 800),
            constant(0.5, 100),
        ]);
        let intervals = detect_speech_intervals(&track, -40.0, 500);
        assert_eq!(
            intervals,
            vec![
                SpeechInterval { start_ms: 100, end_ms: 700 },
                SpeechInterval { start_ms: 1500, end_ms: 1600 },
            ]
        );
    }

    #[test]
    fn test_silent_narration_gets_loud_bed_only() -> anyhow::Result<()> {
        let config = DuckingConfig::default();
        let out = mix(&constant(0.0, 1000), &constant(0.5, 1000), &config)?;
        let expected = 0.5 * db_to_gain(config.silence_duck_db);
        assert!(out.samples.iter().all(|s| (s - expected).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_full_speech_gets_quiet_bed_only() -> anyhow::Result<()> {
        let config = DuckingConfig::default();
        let out = mix(&constant(0.25, 2000), &constant(0.5, 700), &config)?;
        let expected = 0.25 + 0.5 * db_to_gain(config.speech_duck_db);
        assert_eq!(out.len(), ms_to_samples(2000, RATE));
        assert!(out.samples.iter().all(|s| (s - expected).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn test_bed_fades_between_lines() -> anyhow::Result<()> {
        let config = DuckingConfig {
            fade_ms: 200,
            min_silence_ms: 500,
            ..Default::default()
        };
        let narration = join(&[constant(0.25, 1000), constant(0.0, 2000), constant(0.25, 1000)]);
        let out = mix(&narration, &constant(0.5, 500), &config)?;

        let quiet = 0.5 * db_to_gain(config.speech_duck_db);
        let loud = 0.5 * db_to_gain(config.silence_duck_db);
        let at = |ms: u64| out.samples[ms_to_samples(ms, RATE)];

        assert!((at(500) - (0.25 + quiet)).abs() < 1e-5);
        assert!((at(2000) - loud).abs() < 1e-5);
        // Half-way through the fade-out the bed sits between the two levels.
        let mid = at(1000);
        assert!(mid > quiet && mid < loud);
        assert!((at(3500) - (0.25 + quiet)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_two_line_narration_with_short_bgm() -> anyhow::Result<()> {
        let hello = constant(0.3, 4000);
        let sun = constant(0.3, 3000);
        let narration = join(&[hello, sun]);
        let bgm = constant(0.1, 5000);
        assert!(bgm.len() < narration.len());

        let bed = loop_to_length(&bgm.samples, narration.len());
        assert_eq!(bed.len(), narration.len());

        let out = mix(&narration, &bgm, &DuckingConfig::default())?;
        assert_eq!(out.len(), narration.len());
        assert_eq!(out.sample_rate, narration.sample_rate);
        Ok(())
    }

    #[test]
    fn test_mix_clamps_output() -> anyhow::Result<()> {
        let config = DuckingConfig {
            speech_duck_db: 0.0,
            ..Default::default()
        };
        let out = mix(&constant(0.9, 100), &constant(0.9, 100), &config)?;
        assert!(out.samples.iter().all(|s| *s <= 1.0));
        Ok(())
    }

    #[test]
    fn test_empty_bgm_is_mix_error() {
        let result = mix(&constant(0.3, 100), &AudioSegment::new(vec![], RATE), &DuckingConfig::default());
        assert!(matches!(result, Err(PipelineError::Mix(_))));
    }
}
