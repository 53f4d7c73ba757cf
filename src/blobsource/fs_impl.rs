use std::io;
use std::path::{Component, Path, PathBuf};

use super::*;

/// Blobs stored as plain files under a root directory.
///
/// Keys are `/`-separated paths relative to that root. Keys that would
/// escape the root (absolute paths, `..`) are rejected without touching disk.
#[derive(Debug, Clone)]
pub struct FsBlobSource {
    root: PathBuf,
}

impl FsBlobSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl BlobSource for FsBlobSource {
    type Session = FsSession;

    async fn new_session(&self) -> Result<FsSession, BlobError> {
        let unavailable = |source| BlobError::Unavailable {
            location: self.root.display().to_string(),
            source,
        };

        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(unavailable)?;
        let metadata = tokio::fs::metadata(&root).await.map_err(unavailable)?;
        if !metadata.is_dir() {
            return Err(unavailable(io::Error::new(
                io::ErrorKind::InvalidInput,
                "blob root is not a directory",
            )));
        }

        Ok(FsSession { root: Some(root) })
    }
}

#[derive(Debug)]
pub struct FsSession {
    root: Option<PathBuf>,
}

impl FsSession {
    fn resolve(&self, key: &BlobKey) -> Result<PathBuf, BlobError> {
        let invalid = |reason: &str| BlobError::InvalidKey {
            key: key.clone(),
            reason: reason.into(),
        };
        let Some(root) = &self.root else {
            return Err(BlobError::Io {
                key: key.clone(),
                source: io::Error::other("session is closed"),
            });
        };

        let mut path = root.clone();
        for component in Path::new(key.as_str()).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(invalid("parent directory references are not allowed"))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute paths are not allowed"))
                }
            }
        }
        if path == *root {
            return Err(invalid("key does not name a file"));
        }
        Ok(path)
    }
}

#[async_trait::async_trait]
impl BlobSession for FsSession {
    async fn open(&mut self, key: &BlobKey) -> Result<ScopedReader, BlobError> {
        let path = self.resolve(key)?;

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| BlobError::from_io(key, err))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|err| BlobError::from_io(key, err))?;
        if !metadata.is_file() {
            return Err(BlobError::InvalidKey {
                key: key.clone(),
                reason: "not a regular file".into(),
            });
        }

        Ok(ScopedReader::new(key.clone(), file).with_size(metadata.len()))
    }

    fn close(&mut self) {
        self.root = None;
    }
}
