use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod jamendo;

pub use jamendo::JamendoMusicProvider;

fn default_provider() -> String {
    "jamendo".to_string()
}

fn default_limit() -> u32 {
    10
}

fn default_track() -> String {
    "default_bgm.mp3".to_string()
}

fn default_fallback_mood() -> String {
    "calm".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicConfig {
    /// `jamendo` or `none`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Falls back to the `JAMENDO_API_KEY` environment variable.
    #[serde(default)]
    pub jamendo_client_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Used when the provider finds nothing. Relative paths resolve against the voices folder.
    #[serde(default = "default_track")]
    pub default_track: String,
    #[serde(default = "default_fallback_mood")]
    pub fallback_mood: String,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            jamendo_client_id: None,
            limit: default_limit(),
            timeout_seconds: default_timeout_seconds(),
            default_track: default_track(),
            fallback_mood: default_fallback_mood(),
        }
    }
}

impl MusicConfig {
    pub fn client_id(&self) -> Option<String> {
        self.jamendo_client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| std::env::var("JAMENDO_API_KEY").ok())
            .filter(|id| !id.trim().is_empty())
    }

    pub fn default_track_path(&self, voices_folder: &Path) -> Option<PathBuf> {
        if self.default_track.trim().is_empty() {
            return None;
        }
        let path = PathBuf::from(&self.default_track);
        Some(if path.is_absolute() {
            path
        } else {
            voices_folder.join(path)
        })
    }
}

#[async_trait]
pub trait BackgroundMusicProvider: Send + Sync {
    /// Returns a local audio file matching `mood`, or `None` when nothing fits.
    async fn select(&self, mood: &str) -> Result<Option<PathBuf>>;
}

/// Provider that never returns a track; the job then uses the default track or
/// narration only.
pub struct NoMusicProvider;

#[async_trait]
impl BackgroundMusicProvider for NoMusicProvider {
    async fn select(&self, _mood: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

pub fn create_provider(config: &MusicConfig, download_dir: &Path) -> Arc<dyn BackgroundMusicProvider> {
    match (config.provider.as_str(), config.client_id()) {
        ("jamendo", Some(client_id)) => Arc::new(JamendoMusicProvider::new(
            config.clone(),
            client_id,
            download_dir.to_path_buf(),
        )),
        ("jamendo", None) => {
            info!("No Jamendo client id configured, background music search disabled");
            Arc::new(NoMusicProvider)
        }
        (other, _) => {
            if other != "none" {
                info!("Unknown music provider '{}', background music search disabled", other);
            }
            Arc::new(NoMusicProvider)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_track_path() {
        let config = MusicConfig::default();
        assert_eq!(
            config.default_track_path(Path::new("voices")),
            Some(PathBuf::from("voices/default_bgm.mp3"))
        );

        let config = MusicConfig {
            default_track: String::new(),
            ..Default::default()
        };
        assert_eq!(config.default_track_path(Path::new("voices")), None);
    }

    #[tokio::test]
    async fn test_none_provider_selects_nothing() -> Result<()> {
        let config = MusicConfig {
            provider: "none".into(),
            ..Default::default()
        };
        let provider = create_provider(&config, Path::new("."));
        assert_eq!(provider.select("happy").await?, None);
        Ok(())
    }
}
