use super::{BackgroundMusicProvider, MusicConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use rand::prelude::IndexedRandom;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

const TRACKS_ENDPOINT: &str = "https://api.jamendo.com/v3.0/tracks/";
const DOWNLOAD_NAME: &str = "background_music.mp3";

/// Maps a dialogue emotion to the Jamendo tag that best matches it.
pub fn mood_tag(mood: &str) -> String {
    let mood = mood.trim().to_lowercase();
    let tag = match mood.as_str() {
        "fear" | "tense" => "dark",
        "calm" | "peaceful" => "relaxing",
        "joy" => "happy",
        "excitement" => "upbeat",
        "love" => "romantic",
        "hopeful" => "inspirational",
        _ => mood.as_str(),
    };
    tag.to_string()
}

#[derive(Debug, Deserialize)]
struct TracksResponse {
    headers: ResponseHeaders,
    #[serde(default)]
    results: Vec<Track>,
}

#[derive(Debug, Deserialize)]
struct ResponseHeaders {
    #[serde(default)]
    results_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct Track {
    name: String,
    #[serde(default)]
    artist_name: String,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    audio_download: Option<String>,
}

impl Track {
    fn download_url(&self) -> Option<&str> {
        self.audio_download
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.audio.as_deref().filter(|u| !u.is_empty()))
    }
}

pub struct JamendoMusicProvider {
    client: Client,
    config: MusicConfig,
    client_id: String,
    download_dir: PathBuf,
}

impl JamendoMusicProvider {
    pub fn new(config: MusicConfig, client_id: String, download_dir: PathBuf) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config,
            client_id,
            download_dir,
        }
    }

    fn search_url(&self, tag: &str) -> Result<Url> {
        let limit = self.config.limit.to_string();
        Ok(Url::parse_with_params(
            TRACKS_ENDPOINT,
            &[
                ("client_id", self.client_id.as_str()),
                ("format", "json"),
                ("limit", limit.as_str()),
                ("tags", tag),
            ],
        )?)
    }

    async fn search(&self, mood: &str) -> Result<Option<Track>> {
        let tag = mood_tag(mood);
        info!("Searching background music for '{}' (tag: {})", mood, tag);

        let resp = self
            .client
            .get(self.search_url(&tag)?)
            .send()
            .await
            .context("Failed to query Jamendo")?
            .error_for_status()?
            .json::<TracksResponse>()
            .await
            .context("Failed to parse Jamendo response")?;

        if resp.headers.results_count == 0 {
            warn!("No tracks found for tag: {}", tag);
            return Ok(None);
        }

        let candidates: Vec<Track> = resp
            .results
            .into_iter()
            .filter(|t| t.download_url().is_some())
            .collect();
        Ok(candidates.choose(&mut rand::rng()).cloned())
    }

    async fn download(&self, track: &Track) -> Result<PathBuf> {
        let url = track
            .download_url()
            .ok_or_else(|| anyhow!("Track {} has no audio URL", track.name))?;
        info!("Downloading '{}' by {}", track.name, track.artist_name);

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(DOWNLOAD_NAME);
        let mut stream = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start music download")?
            .error_for_status()?
            .bytes_stream();

        let mut file = tokio::fs::File::create(&path).await?;
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Music download interrupted")?;
            total += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes to {:?}", total, path);
        Ok(path)
    }
}

#[async_trait]
impl BackgroundMusicProvider for JamendoMusicProvider {
    async fn select(&self, mood: &str) -> Result<Option<PathBuf>> {
        let mut moods = vec![mood.to_string()];
        if mood_tag(mood) != mood_tag(&self.config.fallback_mood) {
            moods.push(self.config.fallback_mood.clone());
        }

        for mood in moods {
            match self.search(&mood).await {
                Ok(Some(track)) => return self.download(&track).await.map(Some),
                Ok(None) => {}
                Err(e) => warn!("Music search for '{}' failed: {:#}", mood, e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mood_tag() {
        assert_eq!(mood_tag("Fear"), "dark");
        assert_eq!(mood_tag("calm"), "relaxing");
        assert_eq!(mood_tag("joy"), "happy");
        assert_eq!(mood_tag(" nostalgic "), "nostalgic");
        assert_eq!(mood_tag("whimsical"), "whimsical");
    }

    #[test]
    fn test_search_url() -> Result<()> {
        let provider = JamendoMusicProvider::new(
            MusicConfig::default(),
            "abc123".into(),
            PathBuf::from("out"),
        );
        let url = provider.search_url("relaxing")?;
        assert_eq!(
            url.as_str(),
            "https://api.jamendo.com/v3.0/tracks/?client_id=abc123&format=json&limit=10&tags=relaxing"
        );
        Ok(())
    }

    #[test]
    fn test_track_prefers_download_url() -> Result<()> {
        let resp: TracksResponse = serde_json::from_str(
            r#"{
                "headers": {"results_count": 2},
                "results": [
                    {"name": "A", "artist_name": "X", "audio": "http://a/stream", "audio_download": "http://a/dl"},
                    {"name": "B", "artist_name": "Y", "audio": "http://b/stream", "audio_download": ""}
                ]
            }"#,
        )?;
        assert_eq!(resp.results[0].download_url(), Some("http://a/dl"));
        assert_eq!(resp.results[1].download_url(), Some("http://b/stream"));
        Ok(())
    }
}
