use crate::core::config::Config;
use crate::services::voice::{list_catalog_voices, CatalogVoice};
use anyhow::Result;
use inquire::Select;
use log::{info, warn};
use std::path::Path;

const REUSE_LATEST: &str = "Reuse latest embedding";
const SKIP: &str = "Skip (lines will not be spoken)";

/// Characters that appear in the script but have no voice source configured.
pub fn unmapped_characters(config: &Config, characters: &[String]) -> Vec<String> {
    characters
        .iter()
        .filter(|c| !config.characters.contains_key(*c))
        .cloned()
        .collect()
}

fn voice_label(voice: &CatalogVoice) -> String {
    format!("{} ({}) - {}", voice.name, voice.category, voice.filename)
}

fn voice_options(voices: &[CatalogVoice]) -> Vec<String> {
    let mut options = vec![REUSE_LATEST.to_string()];
    options.extend(voices.iter().map(voice_label));
    options.push(SKIP.to_string());
    options
}

/// Maps a menu choice back to a voice source string. `None` means skip.
fn source_for(selection: &str, voices: &[CatalogVoice]) -> Option<String> {
    if selection == REUSE_LATEST {
        return Some("latest".to_string());
    }
    voices
        .iter()
        .find(|v| voice_label(v) == selection)
        .map(CatalogVoice::source_spec)
}

fn select_voice(character: &str, voices: &[CatalogVoice]) -> Result<Option<String>> {
    let prompt = format!("Select a voice for {}:", character);
    let selection = Select::new(&prompt, voice_options(voices)).prompt()?;
    Ok(source_for(&selection, voices))
}

/// Asks for a voice for every character without one and saves the choices to `config.yml`.
pub fn run_setup(config: &mut Config, characters: &[String]) -> Result<()> {
    let missing = unmapped_characters(config, characters);
    if missing.is_empty() {
        return Ok(());
    }

    if config.unattended {
        for character in &missing {
            warn!("No voice configured for {}, reusing its latest embedding", character);
        }
        return Ok(());
    }

    let voices = list_catalog_voices(Path::new(&config.voices_folder))?;
    info!("Found {} catalog voices", voices.len());

    let mut needs_save = false;
    for character in &missing {
        if let Some(source) = select_voice(character, &voices)? {
            config.characters.insert(character.clone(), source);
            needs_save = true;
        }
    }

    if needs_save {
        config.save()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogVoice> {
        vec![CatalogVoice {
            name: "Deep Male".into(),
            filename: "male/deep_male.wav".into(),
            category: "Male".into(),
        }]
    }

    #[test]
    fn test_unmapped_characters() {
        let mut config = Config::default();
        config
            .characters
            .insert("Mira".into(), "uploaded:mira.wav".into());
        let characters = vec!["Mira".to_string(), "Narrator".to_string()];
        assert_eq!(unmapped_characters(&config, &characters), vec!["Narrator"]);
    }

    #[test]
    fn test_menu_choices_map_to_sources() {
        let voices = catalog();
        let options = voice_options(&voices);
        assert_eq!(options.len(), 3);

        assert_eq!(source_for(&options[0], &voices).as_deref(), Some("latest"));
        assert_eq!(
            source_for(&options[1], &voices).as_deref(),
            Some("catalog:male/deep_male.wav")
        );
        assert_eq!(source_for(&options[2], &voices), None);
    }

    #[test]
    fn test_unattended_setup_leaves_mapping_alone() -> Result<()> {
        let mut config = Config {
            unattended: true,
            ..Default::default()
        };
        run_setup(&mut config, &["Ghost".to_string()])?;
        assert!(config.characters.is_empty());
        Ok(())
    }
}
