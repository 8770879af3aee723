pub mod alignment;
pub mod mixer;
pub mod music;
pub mod script;
pub mod setup;
pub mod tts;
pub mod voice;
pub mod workflow;
