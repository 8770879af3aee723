use crate::core::error::ParseError;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

pub const NEUTRAL_EMOTION: &str = "neutral";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub character: String,
    pub emotion: Option<String>,
    pub text: String,
    pub sequence_index: usize,
}

impl DialogueEntry {
    pub fn mood(&self) -> &str {
        self.emotion.as_deref().unwrap_or(NEUTRAL_EMOTION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    LineStart,
    Character,
    AfterCharacter,
    Emotion,
    AfterEmotion,
}

#[derive(Debug, PartialEq, Eq)]
enum HeaderScan {
    /// Tags followed by an opening quote at byte offset `quote_at`.
    Entry {
        character: String,
        emotion: Option<String>,
        quote_at: usize,
    },
    Malformed(&'static str),
    NotATag,
}

fn is_inline_space(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r'
}

fn scan_header(text: &str, start: usize) -> HeaderScan {
    let mut state = HeaderState::LineStart;
    let mut character = String::new();
    let mut emotion = String::new();

    for (offset, c) in text[start..].char_indices() {
        let pos = start + offset;
        state = match (state, c) {
            (HeaderState::LineStart, c) if is_inline_space(c) => HeaderState::LineStart,
            (HeaderState::LineStart, '<') => HeaderState::Character,
            (HeaderState::LineStart, _) => return HeaderScan::NotATag,

            (HeaderState::Character, '>') => {
                if character.trim().is_empty() {
                    return HeaderScan::Malformed("empty character tag");
                }
                HeaderState::AfterCharacter
            }
            (HeaderState::Character, '\n' | '<') => {
                return HeaderScan::Malformed("unterminated character tag")
            }
            (HeaderState::Character, c) => {
                character.push(c);
                HeaderState::Character
            }

            (HeaderState::AfterCharacter, c) if is_inline_space(c) => HeaderState::AfterCharacter,
            (HeaderState::AfterCharacter, '<') => HeaderState::Emotion,
            (HeaderState::AfterCharacter, '"') => {
                return HeaderScan::Entry {
                    character: character.trim().to_string(),
                    emotion: None,
                    quote_at: pos,
                }
            }
            (HeaderState::AfterCharacter, _) => {
                return HeaderScan::Malformed("no quoted text after character tag")
            }

            (HeaderState::Emotion, '>') => HeaderState::AfterEmotion,
            (HeaderState::Emotion, '\n' | '<') => {
                return HeaderScan::Malformed("unterminated emotion tag")
            }
            (HeaderState::Emotion, c) => {
                emotion.push(c);
                HeaderState::Emotion
            }

            (HeaderState::AfterEmotion, c) if is_inline_space(c) => HeaderState::AfterEmotion,
            (HeaderState::AfterEmotion, '"') => {
                let emotion = emotion.trim();
                return HeaderScan::Entry {
                    character: character.trim().to_string(),
                    emotion: (!emotion.is_empty()).then(|| emotion.to_string()),
                    quote_at: pos,
                };
            }
            (HeaderState::AfterEmotion, _) => {
                return HeaderScan::Malformed("no quoted text after emotion tag")
            }
        };
    }

    match state {
        HeaderState::LineStart => HeaderScan::NotATag,
        _ => HeaderScan::Malformed("tag runs into end of input"),
    }
}

fn line_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(text.match_indices('\n').map(|(i, _)| i + 1))
}

/// Byte offset of the last quote in `body` that is not escaped with a backslash.
fn last_unescaped_quote(body: &str) -> Option<usize> {
    body.match_indices('"')
        .map(|(i, _)| i)
        .filter(|&i| !body[..i].ends_with('\\'))
        .last()
}

/// Unparseable lines are skipped; a script without any entry is an error.
pub fn parse_script(text: &str) -> std::result::Result<Vec<DialogueEntry>, ParseError> {
    let mut starts = Vec::new();
    for (line_no, start) in line_starts(text).enumerate() {
        if start >= text.len() {
            continue;
        }
        match scan_header(text, start) {
            HeaderScan::Entry {
                character,
                emotion,
                quote_at,
            } => starts.push((start, character, emotion, quote_at, line_no + 1)),
            HeaderScan::Malformed(reason) => {
                warn!("Skipping line {}: {}", line_no + 1, reason);
            }
            HeaderScan::NotATag => {}
        }
    }

    let mut entries = Vec::with_capacity(starts.len());
    for (i, (_, character, emotion, quote_at, line_no)) in starts.iter().enumerate() {
        let region_end = starts.get(i + 1).map(|s| s.0).unwrap_or(text.len());
        let body = &text[quote_at + 1..region_end];

        let Some(close) = last_unescaped_quote(body) else {
            warn!("Skipping line {}: missing closing quote", line_no);
            continue;
        };

        let line = body[..close].trim().replace("\\\"", "\"");
        if line.is_empty() {
            debug!("Skipping line {}: empty dialogue", line_no);
            continue;
        }

        entries.push(DialogueEntry {
            character: character.clone(),
            emotion: emotion.clone(),
            text: line,
            sequence_index: entries.len(),
        });
    }

    if entries.is_empty() {
        return Err(ParseError::EmptyInput);
    }
    info!("Found {} dialogue entries", entries.len());
    Ok(entries)
}

/// Sorted, de-duplicated character names.
pub fn extract_characters(entries: &[DialogueEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.character.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Character names of a raw script; empty when nothing parses.
pub fn characters_in(text: &str) -> Vec<String> {
    parse_script(text)
        .map(|entries| extract_characters(&entries))
        .unwrap_or_default()
}

/// Most frequent emotion tag, ties going to the one seen first.
pub fn dominant_emotion(entries: &[DialogueEntry]) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (i, emotion) in entries.iter().filter_map(|e| e.emotion.as_deref()).enumerate() {
        let slot = counts.entry(emotion).or_insert((0, i));
        slot.0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        .map(|(emotion, _)| emotion.to_lowercase())
}

/// Reads a script as UTF-8, falling back to Latin-1.
pub fn read_script_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read script {:?}", path))?;
    Ok(decode_script(bytes))
}

pub fn decode_script(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!("Script is not valid UTF-8, decoding as Latin-1");
            e.into_bytes().into_iter().map(char::from).collect()
        }
    }
}
