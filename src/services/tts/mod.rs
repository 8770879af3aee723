use crate::services::voice::VoiceProfile;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod http;

pub use crate::utils::audio::AudioSegment;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Root URL of the speech server, e.g. `http://127.0.0.1:9880`.
    pub base_url: String,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    pub speed: f32,
    /// Sample rate every synthesized clip is converted to before assembly.
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9880".to_string(),
            retry_count: 3,
            retry_delay_seconds: 2,
            speed: 1.0,
            sample_rate: 44100,
        }
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Renders one dialogue line in the given voice. `emotion` is a style hint the
    /// backend may ignore.
    async fn synthesize(
        &self,
        text: &str,
        emotion: Option<&str>,
        profile: &VoiceProfile,
    ) -> Result<AudioSegment>;
}
