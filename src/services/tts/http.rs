use super::{AudioSegment, SpeechSynthesizer, TtsConfig};
use crate::core::io::Storage;
use crate::services::voice::{EmbeddingExtractor, VoiceProfile};
use crate::utils::audio::decode_wav_bytes;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{multipart, Client};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

async fn with_retries<T, F, Fut>(config: &TtsConfig, what: &str, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = config.retry_count.max(1);
    let mut last_error = anyhow!("Unknown error");

    for attempt in 0..max_retries {
        if attempt > 0 {
            warn!("{} failed (attempt {}/{}), retrying...", what, attempt + 1, max_retries);
            sleep(Duration::from_secs(config.retry_delay_seconds)).await;
        }

        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} error: {:#}", what, e);
                last_error = e;
            }
        }
    }

    Err(last_error.context(format!("{} still failing after retries", what)))
}

fn file_part(bytes: Vec<u8>, file_name: &str) -> Result<multipart::Part> {
    multipart::Part::bytes(bytes)
        .file_name(file_name.to_string())
        .mime_str("application/octet-stream")
        .context("Invalid mime type")
}

async fn post_form(client: &Client, url: &str, form: multipart::Form) -> Result<Vec<u8>> {
    let resp = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .with_context(|| format!("Failed to send request to {}", url))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("{} returned {}: {}", url, status, body));
    }

    let bytes = resp.bytes().await.context("Failed to read response body")?;
    Ok(bytes.to_vec())
}

/// Speech server client. Posts the voice artifact together with the line text to
/// `{base_url}/synthesize` and expects WAV bytes back.
pub struct HttpSpeechSynthesizer {
    client: Client,
    config: TtsConfig,
    storage: Arc<dyn Storage>,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: TtsConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            client: Client::new(),
            config,
            storage,
        }
    }

    async fn try_synthesize(
        &self,
        artifact: &[u8],
        text: &str,
        emotion: Option<&str>,
    ) -> Result<AudioSegment> {
        let mut form = multipart::Form::new()
            .part("embedding", file_part(artifact.to_vec(), "voice.emb")?)
            .text("text", text.to_string())
            .text("speed", self.config.speed.to_string());
        if let Some(emotion) = emotion {
            form = form.text("emotion", emotion.to_string());
        }

        let url = format!("{}/synthesize", self.config.base_url.trim_end_matches('/'));
        let bytes = post_form(&self.client, &url, form).await?;
        debug!("Received {} bytes of audio", bytes.len());
        decode_wav_bytes(&bytes)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        emotion: Option<&str>,
        profile: &VoiceProfile,
    ) -> Result<AudioSegment> {
        let artifact = self
            .storage
            .read(&profile.artifact.to_string_lossy())
            .await
            .with_context(|| format!("Failed to read voice artifact {:?}", profile.artifact))?;
        debug!(
            "Synthesizing {} chars as {} ({} byte artifact)",
            text.chars().count(),
            profile.character_key,
            artifact.len()
        );

        with_retries(&self.config, "Speech synthesis", || {
            self.try_synthesize(&artifact, text, emotion)
        })
        .await
    }
}

/// Uploads a voice sample to `{base_url}/extract` and returns the serialized embedding.
pub struct HttpEmbeddingExtractor {
    client: Client,
    config: TtsConfig,
}

impl HttpEmbeddingExtractor {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingExtractor for HttpEmbeddingExtractor {
    async fn extract(&self, sample: &Path) -> Result<Vec<u8>> {
        let data = tokio::fs::read(sample)
            .await
            .with_context(|| format!("Failed to read voice sample {:?}", sample))?;
        let file_name = sample
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample.wav".to_string());
        let url = format!("{}/extract", self.config.base_url.trim_end_matches('/'));
        debug!("Uploading voice sample {} ({} bytes)", file_name, data.len());

        let (client, data, file_name, url) = (&self.client, &data, &file_name, &url);
        let bytes = with_retries(&self.config, "Embedding extraction", || async move {
            let form = multipart::Form::new().part("sample", file_part(data.clone(), file_name)?);
            post_form(client, url, form).await
        })
        .await?;

        if bytes.is_empty() {
            return Err(anyhow!("Extraction server returned an empty embedding"));
        }
        Ok(bytes)
    }
}
