/// Blob object store
///
/// Named blobs on the local filesystem: one file per blob, directories for
/// the `/`-separated name segments. Exclusive write access is granted
/// through fs2 advisory locks on a sidecar `.lease` file; the lease lives
/// as long as the returned guard, so a crashed holder releases it at
/// process exit.
///
/// Blobs in use: `initialindexer/lock`, `checkpoints/<name>`,
/// `blocks/<hash>`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{IndexerError, Result};

pub struct FileBlobStore {
    root: PathBuf,
}

/// Exclusive lease on one blob. Dropping the guard releases the lock.
pub struct BlobLease {
    name: String,
    file: std::fs::File,
}

impl BlobLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in name.split('/') {
            path.push(segment);
        }
        path
    }

    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IndexerError::StorageUnavailable(format!(
                "blob read {}: {}",
                name, e
            ))),
        }
    }

    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(name))
            .await
            .unwrap_or(false)
    }

    /// Acquire the exclusive lease for `name`. Fails immediately with
    /// `LeaseHeldElsewhere` when another holder has it.
    pub fn lease(&self, name: &str) -> Result<BlobLease> {
        let mut path = self.path_for(name);
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| format!("{}.lease", s))
            .ok_or_else(|| IndexerError::other(format!("bad blob name: {}", name)))?;
        path.set_file_name(file_name);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(BlobLease {
                name: name.to_string(),
                file,
            }),
            Err(_) => Err(IndexerError::LeaseHeldElsewhere(name.to_string())),
        }
    }

    /// Write a blob the caller holds the lease for.
    pub async fn write_leased(&self, lease: &BlobLease, name: &str, bytes: &[u8]) -> Result<()> {
        if lease.name() != name {
            return Err(IndexerError::other(format!(
                "lease for '{}' cannot write '{}'",
                lease.name(),
                name
            )));
        }
        self.write(name, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn read_missing_blob_is_none() {
        let dir = TempDir::new().unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();
        assert!(blobs.read("checkpoints/blocks").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_nested_blob() {
        let dir = TempDir::new().unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();
        blobs.write("initialindexer/lock", b"Enqueuing").await.unwrap();
        assert_eq!(
            blobs.read("initialindexer/lock").await.unwrap().unwrap(),
            b"Enqueuing".to_vec()
        );
    }

    #[tokio::test]
    async fn second_lease_is_refused_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();

        let lease = blobs.lease("initialindexer/lock").unwrap();
        match blobs.lease("initialindexer/lock") {
            Err(IndexerError::LeaseHeldElsewhere(name)) => {
                assert_eq!(name, "initialindexer/lock")
            }
            other => panic!("expected lease conflict, got {:?}", other.map(|l| l.name().to_string())),
        }

        drop(lease);
        assert!(blobs.lease("initialindexer/lock").is_ok());
    }

    #[tokio::test]
    async fn leased_write_checks_blob_name() {
        let dir = TempDir::new().unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();
        let lease = blobs.lease("initialindexer/lock").unwrap();
        assert!(blobs
            .write_leased(&lease, "checkpoints/blocks", b"x")
            .await
            .is_err());
        blobs
            .write_leased(&lease, "initialindexer/lock", b"body")
            .await
            .unwrap();
    }
}
