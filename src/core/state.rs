use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Stage {
    Starting,
    ParsingDialogue,
    ResolvingVoices,
    SynthesizingSpeech,
    AssemblingNarration,
    SelectingMusic,
    Mixing,
    GeneratingTimestamps,
    Complete,
    Error(String),
}

impl Stage {
    fn rank(&self) -> u8 {
        match self {
            Stage::Starting => 0,
            Stage::ParsingDialogue => 1,
            Stage::ResolvingVoices => 2,
            Stage::SynthesizingSpeech => 3,
            Stage::AssemblingNarration => 4,
            Stage::SelectingMusic => 5,
            Stage::Mixing => 6,
            Stage::GeneratingTimestamps => 7,
            Stage::Complete | Stage::Error(_) => 8,
        }
    }

    /// Percent reported on entering the stage.
    pub fn floor(&self) -> u8 {
        match self {
            Stage::Starting => 0,
            Stage::ParsingDialogue => 5,
            Stage::ResolvingVoices => 10,
            Stage::SynthesizingSpeech => 10,
            Stage::AssemblingNarration => 70,
            Stage::SelectingMusic => 80,
            Stage::Mixing => 90,
            Stage::GeneratingTimestamps => 95,
            Stage::Complete => 100,
            Stage::Error(_) => 0,
        }
    }

    /// Highest percent the stage may report before the next one begins.
    pub fn ceiling(&self) -> u8 {
        match self {
            Stage::SynthesizingSpeech => 60,
            other => other.floor(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error(_))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Starting => write!(f, "Starting"),
            Stage::ParsingDialogue => write!(f, "Parsing dialogue"),
            Stage::ResolvingVoices => write!(f, "Processing voice samples"),
            Stage::SynthesizingSpeech => write!(f, "Generating speech"),
            Stage::AssemblingNarration => write!(f, "Generating final dialogue audio"),
            Stage::SelectingMusic => write!(f, "Selecting background music"),
            Stage::Mixing => write!(f, "Merging audio files"),
            Stage::GeneratingTimestamps => write!(f, "Generating word timestamps"),
            Stage::Complete => write!(f, "Complete"),
            Stage::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub stage: Stage,
    pub percent: u8,
    pub is_running: bool,
    pub error: Option<String>,
    /// Free-form detail for the current stage, e.g. which line is being spoken.
    pub detail: Option<String>,
    pub output: Option<PathBuf>,
}

impl JobState {
    pub fn idle() -> Self {
        Self {
            stage: Stage::Starting,
            percent: 0,
            is_running: false,
            error: None,
            detail: None,
            output: None,
        }
    }

    fn submitted() -> Self {
        Self {
            is_running: true,
            ..Self::idle()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    pub fn is_error(&self) -> bool {
        matches!(self.stage, Stage::Error(_))
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Shared, lock-protected progress snapshot. The worker mutates it; pollers read whole copies.
#[derive(Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<RwLock<JobState>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, JobState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> JobState {
        self.read().clone()
    }

    pub(crate) fn reset_for_submission(&self) {
        *self.write() = JobState::submitted();
    }

    /// Moves to `stage`. Never goes back to an earlier stage and never lowers the percent.
    pub fn advance(&self, stage: Stage) -> bool {
        let mut state = self.write();
        if state.stage.is_terminal() || stage.is_terminal() || stage.rank() < state.stage.rank() {
            return false;
        }
        state.percent = state.percent.max(stage.floor());
        state.stage = stage;
        state.detail = None;
        true
    }

    /// Reports progress inside the current stage, clamped to the stage's ceiling.
    pub fn report(&self, percent: u8, detail: Option<String>) {
        let mut state = self.write();
        if state.stage.is_terminal() {
            return;
        }
        let clamped = percent.min(state.stage.ceiling());
        state.percent = state.percent.max(clamped);
        state.detail = detail;
    }

    pub fn complete(&self, output: PathBuf) -> bool {
        let mut state = self.write();
        if state.stage.is_terminal() {
            return false;
        }
        state.stage = Stage::Complete;
        state.percent = 100;
        state.detail = None;
        state.output = Some(output);
        state.is_running = false;
        true
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut state = self.write();
        if state.stage.is_terminal() {
            return false;
        }
        let message = message.into();
        state.stage = Stage::Error(message.clone());
        state.error = Some(message);
        state.detail = None;
        state.is_running = false;
        true
    }

    pub(crate) fn stop_running(&self) {
        self.write().is_running = false;
    }
}
