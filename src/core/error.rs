use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("No dialogue parsed from input")]
    EmptyInput,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("No voice profile found for {0}")]
    NoProfile(String),
    #[error("No valid voices")]
    NoUsableVoices,
    #[error("Unrecognized voice source for {character}: {source_spec}")]
    UnrecognizedSource {
        character: String,
        source_spec: String,
    },
    #[error("Voice sample not found for {character}: {path:?}")]
    SampleNotFound { character: String, path: PathBuf },
    #[error("Failed to extract voice embedding for {character}: {reason:#}")]
    Extraction {
        character: String,
        reason: anyhow::Error,
    },
    #[error("Failed to store voice artifact for {character}: {reason:#}")]
    Storage {
        character: String,
        reason: anyhow::Error,
    },
}

/// Failures that end a generation job, or that a stage absorbs and logs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error("Speech synthesis failed for line {index}: {message}")]
    Synthesis { index: usize, message: String },
    #[error("Narration track was not produced: {0}")]
    Assembly(String),
    #[error("Background music unavailable: {0}")]
    Music(String),
    #[error("Mixing failed: {0}")]
    Mix(String),
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("A generation job is already running")]
    Busy,
    #[error("Export failed: {0:#}")]
    Export(anyhow::Error),
}
