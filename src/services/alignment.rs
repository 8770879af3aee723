use crate::services::script::DialogueEntry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    pub enabled: bool,
    /// Speech-to-text endpoint accepting a multipart `file` upload. Without it,
    /// timings come from line spans alone.
    pub stt_url: Option<String>,
    /// Accepted range of transcript words per script word.
    pub tolerance_low: f64,
    pub tolerance_high: f64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stt_url: None,
            tolerance_low: 0.7,
            tolerance_high: 1.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedWord {
    pub word: String,
    /// Seconds from the start of the track.
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampSegment {
    pub id: usize,
    pub speaker: String,
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub words: Vec<TimedWord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TimestampDocument {
    pub segments: Vec<TimestampSegment>,
}

/// Where a synthesized line sits in the narration track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub start_ms: u64,
    pub end_ms: u64,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<Vec<TimedWord>>;
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Deserialize)]
struct TranscriptSegment {
    #[serde(default)]
    words: Vec<TimedWord>,
}

/// Client for a whisper-style server returning `{"segments": [{"words": [...]}]}`.
pub struct HttpTranscriber {
    client: Client,
    url: String,
}

impl HttpTranscriber {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

fn flatten_transcript(body: &str) -> Result<Vec<TimedWord>> {
    let resp: TranscriptResponse =
        serde_json::from_str(body).context("Failed to parse transcript")?;
    Ok(resp
        .segments
        .into_iter()
        .flat_map(|s| s.words)
        .map(|w| TimedWord {
            word: w.word.trim().to_string(),
            ..w
        })
        .filter(|w| !w.word.is_empty())
        .collect())
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<Vec<TimedWord>> {
        let data = tokio::fs::read(audio)
            .await
            .with_context(|| format!("Failed to read {:?}", audio))?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());
        debug!("Uploading {} ({} bytes) for transcription", file_name, data.len());

        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(data).file_name(file_name))
            .text("word_timestamps", "true");
        let body = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .context("Failed to reach transcription server")?
            .error_for_status()?
            .text()
            .await?;
        flatten_transcript(&body)
    }
}

fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Spreads `words` across `span`, each taking time proportional to its length.
fn distribute(words: &[&str], span: LineSpan) -> Vec<TimedWord> {
    let total_chars: usize = words.iter().map(|w| w.chars().count()).sum();
    let start = ms_to_secs(span.start_ms);
    let duration = ms_to_secs(span.end_ms.saturating_sub(span.start_ms));

    let mut consumed = 0usize;
    words
        .iter()
        .map(|word| {
            let len = word.chars().count();
            let word_start = start + duration * consumed as f64 / total_chars.max(1) as f64;
            consumed += len;
            let word_end = start + duration * consumed as f64 / total_chars.max(1) as f64;
            TimedWord {
                word: word.to_string(),
                start: word_start,
                end: word_end,
            }
        })
        .collect()
}

/// Builds the timestamp document for `entries`, whose narration positions are `spans`.
pub fn align(
    entries: &[DialogueEntry],
    spans: &[LineSpan],
    transcript: Option<&[TimedWord]>,
    config: &TimestampConfig,
) -> TimestampDocument {
    let lines: Vec<(&DialogueEntry, LineSpan, Vec<&str>)> = entries
        .iter()
        .zip(spans.iter().copied())
        .map(|(entry, span)| (entry, span, entry.text.split_whitespace().collect()))
        .collect();
    let script_words: usize = lines.iter().map(|(_, _, words)| words.len()).sum();

    let ratio = match transcript {
        Some(t) if !t.is_empty() && script_words > 0 => {
            let ratio = t.len() as f64 / script_words as f64;
            if ratio >= config.tolerance_low && ratio <= config.tolerance_high {
                Some(ratio)
            } else {
                info!(
                    "Transcript has {} words for {} script words, using proportional timings",
                    t.len(),
                    script_words
                );
                None
            }
        }
        _ => None,
    };

    let mut word_index = 0usize;
    let segments = lines
        .into_iter()
        .enumerate()
        .map(|(id, (entry, span, words))| {
            let timed = match (ratio, transcript) {
                (Some(ratio), Some(transcript)) => words
                    .iter()
                    .map(|word| {
                        let source = ((word_index as f64 * ratio).floor() as usize)
                            .min(transcript.len() - 1);
                        word_index += 1;
                        TimedWord {
                            word: word.to_string(),
                            start: transcript[source].start,
                            end: transcript[source].end,
                        }
                    })
                    .collect(),
                _ => distribute(&words, span),
            };
            TimestampSegment {
                id,
                speaker: entry.character.clone(),
                text: entry.text.clone(),
                start: ms_to_secs(span.start_ms),
                end: ms_to_secs(span.end_ms),
                words: timed,
            }
        })
        .collect();

    TimestampDocument { segments }
}
