use crate::errors::{Result, SyncError};
use crate::service::BlobStore;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// A blob store backed by a local directory; keys are relative paths.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SyncError::InvalidArg(format!(
                "blob key '{key}' must be a relative path without '..'"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<bool> {
        let source = self.resolve(remote_key)?;
        if !tokio::fs::try_exists(&source).await? {
            return Ok(false);
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, local_path).await?;
        log::debug!("Fetched {} to {}", source.display(), local_path.display());
        Ok(true)
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<()> {
        let target = self.resolve(remote_key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target).await?;
        log::debug!("Stored {} as {}", local_path.display(), target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_round_trip_and_missing_key() {
        let remote = tempdir().unwrap();
        let local = tempdir().unwrap();
        let store = LocalBlobStore::new(remote.path());

        let missing = local.path().join("missing.bin");
        assert!(!store.download("nope/file.bin", &missing).await.unwrap());

        let source = local.path().join("source.txt");
        std::fs::write(&source, "payload").unwrap();
        store.upload(&source, "runs/latest.txt").await.unwrap();

        let copy = local.path().join("copy.txt");
        assert!(store.download("runs/latest.txt", &copy).await.unwrap());
        assert_eq!(std::fs::read_to_string(copy).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_escaping_keys_rejected() {
        let remote = tempdir().unwrap();
        let store = LocalBlobStore::new(remote.path());
        let result = store.upload(Path::new("/tmp/x"), "../outside").await;
        assert!(matches!(result, Err(SyncError::InvalidArg(_))));
    }
}
