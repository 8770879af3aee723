use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use script2audiobook::core::config::Config;
use script2audiobook::core::io::{NativeStorage, Storage};
use script2audiobook::services::alignment::HttpTranscriber;
use script2audiobook::services::music::create_provider;
use script2audiobook::services::script::{characters_in, read_script_file};
use script2audiobook::services::setup;
use script2audiobook::services::tts::http::{HttpEmbeddingExtractor, HttpSpeechSynthesizer};
use script2audiobook::services::voice::VoiceProfileCache;
use script2audiobook::services::workflow::{JobOrchestrator, JobRequest};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let voices = Arc::new(VoiceProfileCache::new(
        &config.embeddings_folder,
        &config.upload_folder,
        &config.voices_folder,
        Arc::new(HttpEmbeddingExtractor::new(config.tts.clone())),
        storage.clone(),
    ));

    if std::env::args().any(|a| a == "--prune-voices") {
        let removed = voices.prune_superseded().await?;
        println!("Removed {} superseded voice embeddings", removed);
        return Ok(());
    }

    // 2. Read script and make sure every character has a voice
    let script = read_script_file(Path::new(&config.script_path))?;
    let characters = characters_in(&script);
    info!("Characters in script: {}", characters.join(", "));
    setup::run_setup(&mut config, &characters)?;

    // 3. Wire collaborators
    let tts = Arc::new(HttpSpeechSynthesizer::new(config.tts.clone(), storage.clone()));
    let music = create_provider(&config.music, Path::new(&config.output_folder));
    let mut orchestrator = JobOrchestrator::new(config.clone(), voices, tts, music, storage);
    if let Some(url) = config.timestamps.stt_url.clone() {
        orchestrator = orchestrator.with_transcriber(Arc::new(HttpTranscriber::new(url)));
    }

    // 4. Run the job, polling progress
    let handle = orchestrator.submit(JobRequest {
        script,
        characters: config.characters.clone(),
    })?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    let progress = handle.progress().clone();
    let poller = tokio::spawn(async move {
        loop {
            let state = progress.snapshot();
            pb.set_position(state.percent as u64);
            match &state.detail {
                Some(detail) => pb.set_message(format!("{} - {}", state.stage, detail)),
                None => pb.set_message(state.stage.to_string()),
            }
            if !state.is_running {
                pb.finish();
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let state = handle
        .wait_with_timeout(Duration::from_secs(config.job_timeout_seconds))
        .await;
    if let Err(e) = poller.await {
        error!("Progress display failed: {}", e);
    }

    match (&state.output, &state.error) {
        (Some(output), None) => {
            println!("Audiobook ready: {}", output.display());
            Ok(())
        }
        (_, Some(message)) => bail!("Generation failed: {}", message),
        (None, None) => bail!("Generation ended without producing an audiobook"),
    }
}
