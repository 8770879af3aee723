use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::state::{JobState, ProgressHandle, Stage};
use crate::services::alignment::{align, LineSpan, TimedWord, Transcriber};
use crate::services::mixer::{concatenate, mix};
use crate::services::music::BackgroundMusicProvider;
use crate::services::script::{dominant_emotion, extract_characters, parse_script, DialogueEntry};
use crate::services::tts::{AudioSegment, SpeechSynthesizer};
use crate::services::voice::{normalize_key, VoiceProfile, VoiceProfileCache};
use crate::utils::audio::{decode_file, export, resample, samples_to_ms};
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the caller hands over for one audiobook.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub script: String,
    /// Character name -> voice source string.
    pub characters: BTreeMap<String, String>,
}

/// Releases the job slot and clears `is_running` however the worker exits.
struct SlotGuard {
    slot: Arc<AtomicBool>,
    progress: ProgressHandle,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.progress.fail("generation aborted") {
            error!("Generation worker exited without reporting a result");
        }
        self.progress.stop_running();
        self.slot.store(false, Ordering::SeqCst);
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), PipelineError> {
    if token.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// Handle to a submitted job.
pub struct JobHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    progress: ProgressHandle,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    pub async fn wait(self) -> JobState {
        if let Err(e) = self.task.await {
            error!("Generation worker failed: {}", e);
        }
        self.progress.snapshot()
    }

    /// Waits at most `timeout`. On expiry the job is cancelled and marked `Error: timed out`.
    pub async fn wait_with_timeout(mut self, timeout: Duration) -> JobState {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Err(e)) => error!("Generation worker failed: {}", e),
            Ok(Ok(())) => {}
            Err(_) => {
                self.token.cancel();
                if self.progress.fail(PipelineError::Timeout.to_string()) {
                    error!("Generation timed out after {:?}", timeout);
                }
            }
        }
        self.progress.snapshot()
    }
}

/// Runs one audiobook generation at a time on a background task.
pub struct JobOrchestrator {
    config: Arc<Config>,
    voices: Arc<VoiceProfileCache>,
    tts: Arc<dyn SpeechSynthesizer>,
    music: Arc<dyn BackgroundMusicProvider>,
    transcriber: Option<Arc<dyn Transcriber>>,
    storage: Arc<dyn Storage>,
    progress: ProgressHandle,
    slot: Arc<AtomicBool>,
}

impl JobOrchestrator {
    pub fn new(
        config: Config,
        voices: Arc<VoiceProfileCache>,
        tts: Arc<dyn SpeechSynthesizer>,
        music: Arc<dyn BackgroundMusicProvider>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            voices,
            tts,
            music,
            transcriber: None,
            storage,
            progress: ProgressHandle::new(),
            slot: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn snapshot(&self) -> JobState {
        self.progress.snapshot()
    }

    /// Starts a job. Fails with `Busy` while another job holds the slot.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, PipelineError> {
        if self
            .slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::Busy);
        }
        self.progress.reset_for_submission();

        let token = CancellationToken::new();
        let guard = SlotGuard {
            slot: self.slot.clone(),
            progress: self.progress.clone(),
        };
        let job = Job {
            config: self.config.clone(),
            voices: self.voices.clone(),
            tts: self.tts.clone(),
            music: self.music.clone(),
            transcriber: self.transcriber.clone(),
            storage: self.storage.clone(),
            progress: self.progress.clone(),
            token: token.clone(),
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            match job.run(&request).await {
                Ok(output) => {
                    info!("Audiobook written to {:?}", output);
                    job.progress.complete(output);
                }
                Err(e) => {
                    error!("Generation failed: {}", e);
                    job.progress.fail(e.to_string());
                }
            }
        });

        Ok(JobHandle {
            token,
            task,
            progress: self.progress.clone(),
        })
    }

    /// Submits and waits, bounded by `job_timeout_seconds`.
    pub async fn run_to_completion(&self, request: JobRequest) -> Result<JobState, PipelineError> {
        let handle = self.submit(request)?;
        Ok(handle
            .wait_with_timeout(Duration::from_secs(self.config.job_timeout_seconds))
            .await)
    }
}

struct Job {
    config: Arc<Config>,
    voices: Arc<VoiceProfileCache>,
    tts: Arc<dyn SpeechSynthesizer>,
    music: Arc<dyn BackgroundMusicProvider>,
    transcriber: Option<Arc<dyn Transcriber>>,
    storage: Arc<dyn Storage>,
    progress: ProgressHandle,
    token: CancellationToken,
}

impl Job {
    fn enter(&self, stage: Stage) -> Result<(), PipelineError> {
        checkpoint(&self.token)?;
        info!("{}", stage);
        self.progress.advance(stage);
        Ok(())
    }

    async fn run(&self, request: &JobRequest) -> Result<PathBuf, PipelineError> {
        self.enter(Stage::ParsingDialogue)?;
        let entries = parse_script(&request.script)?;
        info!("Parsed {} dialogue lines", entries.len());

        self.enter(Stage::ResolvingVoices)?;
        let characters = extract_characters(&entries);
        let profiles = tokio::select! {
            _ = self.token.cancelled() => return Err(PipelineError::Cancelled),
            resolved = self.voices.resolve_all(&characters, &request.characters) => resolved?,
        };

        self.enter(Stage::SynthesizingSpeech)?;
        let spoken = self.synthesize_lines(&entries, &profiles).await?;

        self.enter(Stage::AssemblingNarration)?;
        let rate = self.config.tts.sample_rate;
        let mut segments = Vec::with_capacity(spoken.len());
        for (_, segment) in &spoken {
            segments.push(
                resample(segment, rate).map_err(|e| PipelineError::Assembly(format!("{:#}", e)))?,
            );
        }
        let spans = line_spans(&segments);
        let narration = concatenate(&segments)?;
        info!("Narration is {} ms long", narration.duration_ms());

        self.enter(Stage::SelectingMusic)?;
        let mood = dominant_emotion(&entries).unwrap_or_else(|| self.config.music.fallback_mood.clone());
        let bgm = self.select_music(&mood).await?;

        self.enter(Stage::Mixing)?;
        let track = match bgm {
            Some(bgm) => self.mix_or_narration(narration, bgm).await,
            None => {
                info!("No background music, exporting narration only");
                narration
            }
        };

        checkpoint(&self.token)?;
        let output = self.config.output_path();
        let format = self.config.output_format;
        let target = output.clone();
        tokio::task::spawn_blocking(move || export(&track, &target, format))
            .await
            .map_err(|e| PipelineError::Export(e.into()))?
            .map_err(PipelineError::Export)?;
        discard_if_cancelled(&self.token, &output).await?;

        if self.config.timestamps.enabled {
            self.enter(Stage::GeneratingTimestamps)?;
            let lines: Vec<DialogueEntry> = spoken.into_iter().map(|(entry, _)| entry).collect();
            self.write_timestamps(&lines, &spans, &output).await;
        }

        Ok(output)
    }

    async fn synthesize_lines(
        &self,
        entries: &[DialogueEntry],
        profiles: &HashMap<String, Arc<VoiceProfile>>,
    ) -> Result<Vec<(DialogueEntry, AudioSegment)>, PipelineError> {
        let total = entries.len();
        let mut spoken = Vec::with_capacity(total);

        for (i, entry) in entries.iter().enumerate() {
            checkpoint(&self.token)?;
            let detail = format!("Line {}/{}: {}", i + 1, total, entry.character);

            match profiles.get(&normalize_key(&entry.character)) {
                None => warn!("No voice for {}, skipping line {}", entry.character, i + 1),
                Some(profile) => {
                    let result = tokio::select! {
                        _ = self.token.cancelled() => return Err(PipelineError::Cancelled),
                        r = self.tts.synthesize(&entry.text, entry.emotion.as_deref(), profile) => r,
                    };
                    match result {
                        Ok(segment) if !segment.is_empty() => spoken.push((entry.clone(), segment)),
                        Ok(_) => warn!("Empty audio for line {}, skipping", i + 1),
                        Err(e) => warn!(
                            "{:#}",
                            PipelineError::Synthesis {
                                index: i + 1,
                                message: format!("{:#}", e),
                            }
                        ),
                    }
                }
            }

            let percent = 10 + ((i + 1) * 50 / total.max(1)) as u8;
            self.progress.report(percent, Some(detail));
        }

        Ok(spoken)
    }

    /// Provider first, then the bundled default track. `None` means narration only.
    async fn select_music(&self, mood: &str) -> Result<Option<AudioSegment>, PipelineError> {
        info!("Selecting background music for mood '{}'", mood);
        let selected = tokio::select! {
            _ = self.token.cancelled() => return Err(PipelineError::Cancelled),
            r = self.music.select(mood) => r,
        };

        let mut candidates = Vec::new();
        match selected {
            Ok(Some(path)) => candidates.push(path),
            Ok(None) => warn!("No background music found for '{}'", mood),
            Err(e) => warn!("{}", PipelineError::Music(format!("{:#}", e))),
        }
        if let Some(default) = self
            .config
            .music
            .default_track_path(Path::new(&self.config.voices_folder))
        {
            if default.exists() {
                candidates.push(default);
            }
        }

        for path in candidates {
            let source = path.clone();
            match tokio::task::spawn_blocking(move || decode_file(&source)).await {
                Ok(Ok(bgm)) if !bgm.is_empty() => {
                    info!("Using background music {:?}", path);
                    return Ok(Some(bgm));
                }
                Ok(Ok(_)) => warn!("Background music {:?} is empty", path),
                Ok(Err(e)) => warn!("Could not decode {:?}: {:#}", path, e),
                Err(e) => warn!("Could not decode {:?}: {}", path, e),
            }
        }
        Ok(None)
    }

    async fn mix_or_narration(&self, narration: AudioSegment, bgm: AudioSegment) -> AudioSegment {
        let config = self.config.mix.clone();
        let speech = narration.clone();
        let mixed = tokio::task::spawn_blocking(move || mix(&speech, &bgm, &config)).await;
        match mixed {
            Ok(Ok(track)) => track,
            Ok(Err(e)) => {
                warn!("{}. Exporting narration only.", e);
                narration
            }
            Err(e) => {
                warn!("{}. Exporting narration only.", PipelineError::Mix(e.to_string()));
                narration
            }
        }
    }

    async fn write_timestamps(&self, lines: &[DialogueEntry], spans: &[LineSpan], audio: &Path) {
        let transcript: Option<Vec<TimedWord>> = match &self.transcriber {
            Some(transcriber) => match transcriber.transcribe(audio).await {
                Ok(words) => Some(words),
                Err(e) => {
                    warn!("Transcription failed, using line timings: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let document = align(lines, spans, transcript.as_deref(), &self.config.timestamps);
        let path = self.config.timestamps_path();
        let written = match serde_json::to_vec_pretty(&document) {
            Ok(json) => self.storage.write(&path.to_string_lossy(), &json).await,
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => info!("Word timestamps saved to {:?}", path),
            Err(e) => warn!("Failed to save word timestamps, continuing without them: {:#}", e),
        }
    }
}

/// Removes an output that finished encoding after the job was cancelled.
async fn discard_if_cancelled(token: &CancellationToken, output: &Path) -> Result<(), PipelineError> {
    if !token.is_cancelled() {
        return Ok(());
    }
    if let Err(e) = tokio::fs::remove_file(output).await {
        warn!("Failed to remove {:?} after cancellation: {}", output, e);
    }
    Err(PipelineError::Cancelled)
}

fn line_spans(segments: &[AudioSegment]) -> Vec<LineSpan> {
    let mut offset = 0usize;
    segments
        .iter()
        .map(|segment| {
            let start_ms = samples_to_ms(offset, segment.sample_rate);
            offset += segment.len();
            LineSpan {
                start_ms,
                end_ms: samples_to_ms(offset, segment.sample_rate),
            }
        })
        .collect()
}
