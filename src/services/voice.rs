use crate::core::error::VoiceError;
use crate::core::io::Storage;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const ARTIFACT_EXTENSION: &str = "emb";
const CATALOG_PREFIX: &str = "default_voices/";
const MAX_NAME_ATTEMPTS: i64 = 1000;
const RESOLVE_CONCURRENCY: usize = 4;

#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    /// Extracts a speaker embedding from a voice sample and returns the serialized artifact.
    async fn extract(&self, sample: &Path) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceSource {
    /// A sample uploaded by the user, relative to the upload folder.
    Uploaded(PathBuf),
    /// A bundled catalog voice, relative to the catalog folder.
    Catalog(PathBuf),
    Embedding(PathBuf),
    ReuseLatest,
}

impl VoiceSource {
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("latest") {
            return Some(Self::ReuseLatest);
        }
        if let Some(file) = spec.strip_prefix("uploaded:") {
            return Some(Self::Uploaded(PathBuf::from(file.trim())));
        }
        if let Some(path) = spec.strip_prefix("catalog:") {
            return Some(Self::Catalog(PathBuf::from(path.trim())));
        }
        if let Some(path) = spec.strip_prefix(CATALOG_PREFIX) {
            return Some(Self::Catalog(PathBuf::from(path)));
        }
        if let Some(path) = spec.strip_prefix("embedding:") {
            return Some(Self::Embedding(PathBuf::from(path.trim())));
        }
        if spec.ends_with(".emb") || spec.ends_with(".pth") {
            return Some(Self::Embedding(PathBuf::from(spec)));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    pub character_key: String,
    pub artifact: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Lower-case, whitespace to `_`, anything outside `[a-z0-9_-]` to `_`.
pub fn normalize_key(character: &str) -> String {
    character
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn artifact_timestamp(key: &str, file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix(key)?
        .strip_prefix('_')?
        .strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))?
        .parse()
        .ok()
}

/// Splits `<key>_<millis>.emb` into its key and timestamp.
fn split_artifact_name(file_name: &str) -> Option<(&str, i64)> {
    let stem = file_name.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))?;
    let (key, millis) = stem.rsplit_once('_')?;
    Some((key, millis.parse().ok()?))
}

pub struct VoiceProfileCache {
    artifact_dir: PathBuf,
    upload_dir: PathBuf,
    catalog_dir: PathBuf,
    extractor: Arc<dyn EmbeddingExtractor>,
    storage: Arc<dyn Storage>,
    current: Mutex<HashMap<String, Arc<VoiceProfile>>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VoiceProfileCache {
    pub fn new(
        artifact_dir: impl Into<PathBuf>,
        upload_dir: impl Into<PathBuf>,
        catalog_dir: impl Into<PathBuf>,
        extractor: Arc<dyn EmbeddingExtractor>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            upload_dir: upload_dir.into(),
            catalog_dir: catalog_dir.into(),
            extractor,
            storage,
            current: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Sample file behind a source that carries new audio.
    fn sample_path(&self, source: &VoiceSource) -> Option<PathBuf> {
        match source {
            VoiceSource::Uploaded(file) => Some(self.upload_dir.join(file)),
            VoiceSource::Catalog(path) => Some(self.catalog_dir.join(path)),
            _ => None,
        }
    }

    fn current_profile(&self, key: &str) -> Option<Arc<VoiceProfile>> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.get(key).cloned()
    }

    fn register(&self, profile: VoiceProfile) -> Arc<VoiceProfile> {
        let profile = Arc::new(profile);
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.insert(profile.character_key.clone(), profile.clone());
        profile
    }

    /// New audio always produces a fresh artifact. Calls for the same character run one at a time.
    pub async fn resolve(
        &self,
        character: &str,
        source: &VoiceSource,
    ) -> std::result::Result<Arc<VoiceProfile>, VoiceError> {
        let key = normalize_key(character);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if let Some(sample) = self.sample_path(source) {
            if !sample.exists() {
                return Err(VoiceError::SampleNotFound {
                    character: character.to_string(),
                    path: sample,
                });
            }

            info!("Generating new embedding for {} from {:?}", character, sample);
            let bytes = self
                .extractor
                .extract(&sample)
                .await
                .map_err(|reason| VoiceError::Extraction {
                    character: character.to_string(),
                    reason,
                })?;
            let profile = self
                .persist(&key, &bytes)
                .await
                .map_err(|reason| VoiceError::Storage {
                    character: character.to_string(),
                    reason,
                })?;
            return Ok(self.register(profile));
        }

        match source {
            VoiceSource::Embedding(path) => {
                if !path.exists() {
                    return Err(VoiceError::SampleNotFound {
                        character: character.to_string(),
                        path: path.clone(),
                    });
                }
                info!("Using provided embedding file for {}", character);
                Ok(self.register(VoiceProfile {
                    character_key: key,
                    artifact: path.clone(),
                    created_at: Utc::now(),
                }))
            }
            _ => {
                if let Some(profile) = self.current_profile(&key) {
                    return Ok(profile);
                }
                match self.latest_on_disk(&key).await {
                    Some(profile) => {
                        info!("Using latest embedding for {}: {:?}", character, profile.artifact);
                        Ok(self.register(profile))
                    }
                    None => Err(VoiceError::NoProfile(character.to_string())),
                }
            }
        }
    }

    async fn persist(&self, key: &str, bytes: &[u8]) -> Result<VoiceProfile> {
        let mut millis = Utc::now().timestamp_millis();
        if let Some(existing) = self.current_profile(key) {
            millis = millis.max(existing.created_at.timestamp_millis() + 1);
        }

        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self
                .artifact_dir
                .join(format!("{}_{}.{}", key, millis, ARTIFACT_EXTENSION));
            if self.storage.write_new(&path.to_string_lossy(), bytes).await? {
                let created_at = DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now);
                return Ok(VoiceProfile {
                    character_key: key.to_string(),
                    artifact: path,
                    created_at,
                });
            }
            millis += 1;
        }
        anyhow::bail!("No free artifact name for {}", key)
    }

    async fn latest_on_disk(&self, key: &str) -> Option<VoiceProfile> {
        let entries = match self.storage.list(&self.artifact_dir.to_string_lossy()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list voice artifacts: {:#}", e);
                return None;
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| {
                let path = PathBuf::from(entry);
                let name = path.file_name()?.to_str()?.to_string();
                Some((artifact_timestamp(key, &name)?, path))
            })
            .max_by_key(|(millis, _)| *millis)
            .map(|(millis, artifact)| VoiceProfile {
                character_key: key.to_string(),
                artifact,
                created_at: DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now),
            })
    }

    /// Characters missing from `mapping` reuse their latest artifact. Keyed by normalized key.
    pub async fn resolve_all(
        &self,
        characters: &[String],
        mapping: &BTreeMap<String, String>,
    ) -> std::result::Result<HashMap<String, Arc<VoiceProfile>>, VoiceError> {
        let requests: Vec<(String, String)> = characters
            .iter()
            .map(|c| (c.clone(), mapping.get(c).cloned().unwrap_or_default()))
            .collect();

        let results: Vec<(String, std::result::Result<Arc<VoiceProfile>, VoiceError>)> =
            futures_util::stream::iter(requests)
                .map(|(character, spec)| async move {
                    let result = match VoiceSource::parse(&spec) {
                        Some(source) => self.resolve(&character, &source).await,
                        None => Err(VoiceError::UnrecognizedSource {
                            character: character.clone(),
                            source_spec: spec,
                        }),
                    };
                    (character, result)
                })
                .buffer_unordered(RESOLVE_CONCURRENCY)
                .collect()
                .await;

        let mut resolved = HashMap::new();
        for (character, result) in results {
            match result {
                Ok(profile) => {
                    info!("Using voice for {}: {:?}", character, profile.artifact);
                    resolved.insert(profile.character_key.clone(), profile);
                }
                Err(e) => warn!("{}. Skipping.", e),
            }
        }

        if resolved.is_empty() {
            return Err(VoiceError::NoUsableVoices);
        }
        Ok(resolved)
    }

    /// Deletes every artifact except the newest one per character. Returns how many were removed.
    pub async fn prune_superseded(&self) -> Result<usize> {
        let entries = self.storage.list(&self.artifact_dir.to_string_lossy()).await?;

        let mut newest: HashMap<String, i64> = HashMap::new();
        let mut artifacts = Vec::new();
        for entry in entries {
            let Some(name) = Path::new(&entry).file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((key, millis)) = split_artifact_name(name) else {
                continue;
            };
            let slot = newest.entry(key.to_string()).or_insert(millis);
            *slot = (*slot).max(millis);
            artifacts.push((key.to_string(), millis, entry.clone()));
        }

        let mut removed = 0;
        for (key, millis, path) in artifacts {
            if newest.get(&key).is_some_and(|&latest| millis < latest) {
                self.storage.delete(&path).await?;
                removed += 1;
            }
        }
        info!("Pruned {} superseded voice artifacts", removed);
        Ok(removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogVoice {
    pub name: String,
    pub filename: String,
    pub category: String,
}

impl CatalogVoice {
    /// The mapping string that selects this voice.
    pub fn source_spec(&self) -> String {
        format!("catalog:{}", self.filename)
    }
}

fn title_case(s: &str) -> String {
    s.replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn collect_catalog(root: &Path, dir: &Path, voices: &mut Vec<CatalogVoice>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_catalog(root, &path, voices)?;
            continue;
        }
        let is_audio = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("mp3"));
        if !is_audio {
            continue;
        }

        let rel = path.strip_prefix(root).unwrap_or(&path);
        let category = rel
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .map(|p| title_case(&p))
            .unwrap_or_else(|| "Default".to_string());
        let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();

        voices.push(CatalogVoice {
            name: title_case(&stem),
            filename: rel.to_string_lossy().replace('\\', "/"),
            category,
        });
    }
    Ok(())
}

/// Lists the bundled voice samples, sorted by category and name.
pub fn list_catalog_voices(dir: &Path) -> Result<Vec<CatalogVoice>> {
    let mut voices = Vec::new();
    if dir.exists() {
        collect_catalog(dir, dir, &mut voices)?;
    }
    voices.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
    Ok(voices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingExtractor for CountingExtractor {
        async fn extract(&self, sample: &Path) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if sample.to_string_lossy().contains("broken") {
                anyhow::bail!("extractor rejected sample");
            }
            Ok(format!("embedding of {}", sample.display()).into_bytes())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        extractor: Arc<CountingExtractor>,
        cache: VoiceProfileCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("uploads")).unwrap();
        fs::create_dir_all(root.join("catalog/female")).unwrap();
        fs::write(root.join("uploads/mira.wav"), b"RIFF").unwrap();
        fs::write(root.join("uploads/broken.wav"), b"RIFF").unwrap();
        fs::write(root.join("catalog/female/soft_voice.mp3"), b"ID3").unwrap();

        let extractor = Arc::new(CountingExtractor {
            calls: AtomicUsize::new(0),
        });
        let cache = VoiceProfileCache::new(
            root.join("embeddings"),
            root.join("uploads"),
            root.join("catalog"),
            extractor.clone(),
            Arc::new(NativeStorage::new()),
        );
        Fixture {
            _dir: dir,
            root,
            extractor,
            cache,
        }
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            VoiceSource::parse("uploaded:mira.wav"),
            Some(VoiceSource::Uploaded("mira.wav".into()))
        );
        assert_eq!(
            VoiceSource::parse("default_voices/female/soft.mp3"),
            Some(VoiceSource::Catalog("female/soft.mp3".into()))
        );
        assert_eq!(
            VoiceSource::parse("voice_embeddings/mira_1.emb"),
            Some(VoiceSource::Embedding("voice_embeddings/mira_1.emb".into()))
        );
        assert_eq!(VoiceSource::parse(""), Some(VoiceSource::ReuseLatest));
        assert_eq!(VoiceSource::parse("Latest"), Some(VoiceSource::ReuseLatest));
        assert_eq!(VoiceSource::parse("http://somewhere"), None);
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  Elder Wren "), "elder_wren");
        assert_eq!(normalize_key("../Mira"), "___mira");
    }

    #[tokio::test]
    async fn test_new_sample_creates_fresh_artifact() -> Result<()> {
        let f = fixture();
        let source = VoiceSource::Uploaded("mira.wav".into());

        let first = f.cache.resolve("Mira", &source).await?;
        let second = f.cache.resolve("Mira", &source).await?;

        assert_eq!(f.extractor.calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.artifact, second.artifact);
        assert!(second.created_at > first.created_at);
        assert!(first.artifact.exists());
        assert!(second.artifact.exists());
        assert_eq!(first.character_key, "mira");
        Ok(())
    }

    #[tokio::test]
    async fn test_reuse_latest_is_idempotent() -> Result<()> {
        let f = fixture();
        let created = f
            .cache
            .resolve("Mira", &VoiceSource::Catalog("female/soft_voice.mp3".into()))
            .await?;

        let a = f.cache.resolve("Mira", &VoiceSource::ReuseLatest).await?;
        let b = f.cache.resolve("mira", &VoiceSource::ReuseLatest).await?;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.artifact, created.artifact);
        assert_eq!(f.extractor.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reuse_latest_reads_newest_artifact_from_disk() -> Result<()> {
        let f = fixture();
        let dir = f.root.join("embeddings");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("elder_wren_1000.emb"), b"old")?;
        fs::write(dir.join("elder_wren_2000.emb"), b"new")?;
        fs::write(dir.join("elder_wren_jr_3000.emb"), b"other character")?;

        let profile = f.cache.resolve("Elder Wren", &VoiceSource::ReuseLatest).await?;
        assert_eq!(profile.artifact, dir.join("elder_wren_2000.emb"));
        assert_eq!(profile.created_at.timestamp_millis(), 2000);
        Ok(())
    }

    #[tokio::test]
    async fn test_reuse_latest_without_artifact_fails() {
        let f = fixture();
        let err = f.cache.resolve("Ghost", &VoiceSource::ReuseLatest).await.unwrap_err();
        assert!(matches!(err, VoiceError::NoProfile(name) if name == "Ghost"));
    }

    #[tokio::test]
    async fn test_missing_sample_is_reported() {
        let f = fixture();
        let err = f
            .cache
            .resolve("Mira", &VoiceSource::Uploaded("nope.wav".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::SampleNotFound { .. }));
        assert_eq!(f.extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_all_skips_failures() -> Result<()> {
        let f = fixture();
        let mapping = BTreeMap::from([
            ("Mira".to_string(), "uploaded:mira.wav".to_string()),
            ("Milo".to_string(), "uploaded:broken.wav".to_string()),
            ("Ghost".to_string(), "latest".to_string()),
            ("Robot".to_string(), "ftp://x".to_string()),
        ]);

        let characters: Vec<String> = mapping.keys().cloned().collect();

        let resolved = f.cache.resolve_all(&characters, &mapping).await?;
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("mira"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_all_reuses_latest_for_unmapped_characters() -> Result<()> {
        let f = fixture();
        let dir = f.root.join("embeddings");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("narrator_1000.emb"), b"narrator")?;
        let mapping = BTreeMap::from([("Mira".to_string(), "uploaded:mira.wav".to_string())]);
        let characters = vec!["Mira".to_string(), "Narrator".to_string()];

        let resolved = f.cache.resolve_all(&characters, &mapping).await?;
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["narrator"].artifact, dir.join("narrator_1000.emb"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_all_with_no_voices_fails() {
        let f = fixture();
        let mapping = BTreeMap::from([("Ghost".to_string(), "latest".to_string())]);
        let err = f
            .cache
            .resolve_all(&["Ghost".to_string()], &mapping)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::NoUsableVoices));
        assert_eq!(err.to_string(), "No valid voices");
    }

    #[tokio::test]
    async fn test_concurrent_resolves_never_share_a_file() -> Result<()> {
        let f = Arc::new(fixture());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.cache
                    .resolve("Mira", &VoiceSource::Uploaded("mira.wav".into()))
                    .await
                    .map(|p| p.artifact.clone())
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await?.map_err(|e| anyhow::anyhow!("{}", e))?);
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_per_character() -> Result<()> {
        let f = fixture();
        let dir = f.root.join("embeddings");
        fs::create_dir_all(&dir)?;
        for name in ["mira_1.emb", "mira_2.emb", "milo_5.emb", "notes.txt"] {
            fs::write(dir.join(name), b"x")?;
        }

        assert_eq!(f.cache.prune_superseded().await?, 1);
        assert!(!dir.join("mira_1.emb").exists());
        assert!(dir.join("mira_2.emb").exists());
        assert!(dir.join("milo_5.emb").exists());
        assert!(dir.join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn test_list_catalog_voices() -> Result<()> {
        let f = fixture();
        fs::write(f.root.join("catalog/old_man.wav"), b"RIFF")?;
        fs::write(f.root.join("catalog/readme.md"), b"#")?;

        let voices = list_catalog_voices(&f.root.join("catalog"))?;
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[0].category, "Default");
        assert_eq!(voices[0].name, "Old Man");
        assert_eq!(voices[1].category, "Female");
        assert_eq!(voices[1].filename, "female/soft_voice.mp3");
        assert_eq!(voices[1].source_spec(), "catalog:female/soft_voice.mp3");
        Ok(())
    }
}
