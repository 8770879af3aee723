use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::services::alignment::TimestampConfig;
use crate::services::mixer::DuckingConfig;
use crate::services::music::MusicConfig;
use crate::services::tts::TtsConfig;
use crate::utils::audio::OutputFormat;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_script")]
    pub script_path: String,

    #[serde(default = "default_upload")]
    pub upload_folder: String,

    /// Catalog of bundled voice samples, grouped by sub-directory.
    #[serde(default = "default_voices")]
    pub voices_folder: String,

    #[serde(default = "default_embeddings")]
    pub embeddings_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_output_file")]
    pub output_file: String,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,

    /// Character name -> voice source (`uploaded:<file>`, `default_voices/<path>`, `latest`, ...).
    #[serde(default)]
    pub characters: BTreeMap<String, String>,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub music: MusicConfig,

    #[serde(default)]
    pub mix: DuckingConfig,

    #[serde(default)]
    pub timestamps: TimestampConfig,
}

fn default_script() -> String {
    "input.txt".to_string()
}
fn default_upload() -> String {
    "uploads".to_string()
}
fn default_voices() -> String {
    "default_voices".to_string()
}
fn default_embeddings() -> String {
    "voice_embeddings".to_string()
}
fn default_output() -> String {
    "outputs".to_string()
}
fn default_output_file() -> String {
    "audiobook.mp3".to_string()
}
fn default_job_timeout() -> u64 {
    2400
}

impl Default for Config {
    fn default() -> Self {
        Self {
            script_path: default_script(),
            upload_folder: default_upload(),
            voices_folder: default_voices(),
            embeddings_folder: default_embeddings(),
            output_folder: default_output(),
            output_file: default_output_file(),
            output_format: OutputFormat::default(),
            unattended: false,
            job_timeout_seconds: default_job_timeout(),
            characters: BTreeMap::new(),
            tts: TtsConfig::default(),
            music: MusicConfig::default(),
            mix: DuckingConfig::default(),
            timestamps: TimestampConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.upload_folder)?;
        fs::create_dir_all(&self.voices_folder)?;
        fs::create_dir_all(&self.embeddings_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        Path::new(&self.output_folder).join(&self.output_file)
    }

    pub fn timestamps_path(&self) -> PathBuf {
        Path::new(&self.output_folder).join("word_timestamps.json")
    }
}
