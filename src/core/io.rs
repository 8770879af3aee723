use anyhow::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    /// Creates `path` only if nothing exists there yet. Returns `false` when the path is taken.
    async fn write_new(&self, path: &str, content: &[u8]) -> Result<bool>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        ensure_parent(path).await?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn write_new(&self, path: &str, content: &[u8]) -> Result<bool> {
        ensure_parent(path).await?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;

        let mut file = match file {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(content).await?;
        file.flush().await?;
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::new(prefix);
        let mut entries = Vec::new();

        if path.exists() {
            if path.is_dir() {
                let mut dir = tokio::fs::read_dir(path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
            } else {
                entries.push(prefix.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_new_never_overwrites() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("a.emb");
        let path = path.to_str().unwrap();
        let storage = NativeStorage::new();

        assert!(storage.write_new(path, b"first").await?);
        assert!(!storage.write_new(path, b"second").await?);
        assert_eq!(storage.read(path).await?, b"first");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_and_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        storage.write(a.to_str().unwrap(), b"a").await?;
        storage.write(b.to_str().unwrap(), b"b").await?;

        let listed = storage.list(dir.path().to_str().unwrap()).await?;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("a.txt"));

        storage.delete(a.to_str().unwrap()).await?;
        assert!(!storage.exists(a.to_str().unwrap()).await?);
        assert!(storage.list("does/not/exist").await?.is_empty());
        Ok(())
    }
}
