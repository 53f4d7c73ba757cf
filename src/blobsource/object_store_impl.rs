use std::io;
use std::sync::Arc;

use futures_util::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use tokio_util::io::StreamReader;
use url::Url;

use super::*;

/// Blobs in any [`ObjectStore`], below a fixed prefix.
#[derive(Debug, Clone)]
pub struct ObjectStoreBlobSource {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStoreBlobSource {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    /// Builds the store from a URL such as `file:///srv/photos`, `memory:///`
    /// or `s3://bucket/photos`. The path part of the URL becomes the key prefix.
    pub fn from_url(url: &str) -> Result<Self, BlobError> {
        let parsed = Url::parse(url).map_err(|err| BlobError::Unavailable {
            location: url.into(),
            source: io::Error::new(io::ErrorKind::InvalidInput, err),
        })?;
        let (store, prefix) = object_store::parse_url(&parsed)?;
        Ok(Self::new(Arc::from(store), prefix))
    }
}

#[async_trait::async_trait]
impl BlobSource for ObjectStoreBlobSource {
    type Session = ObjectStoreSession;

    async fn new_session(&self) -> Result<ObjectStoreSession, BlobError> {
        // listing the prefix surfaces bad credentials or an unreachable bucket up front
        self.store
            .list_with_delimiter(Some(&self.prefix))
            .await?;

        Ok(ObjectStoreSession {
            store: Some(Arc::clone(&self.store)),
            prefix: self.prefix.clone(),
        })
    }
}

#[derive(Debug)]
pub struct ObjectStoreSession {
    store: Option<Arc<dyn ObjectStore>>,
    prefix: Path,
}

impl ObjectStoreSession {
    fn location(&self, key: &BlobKey) -> Result<Path, BlobError> {
        let key_path = Path::parse(key.as_str()).map_err(|err| BlobError::InvalidKey {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        if key_path.parts().next().is_none() {
            return Err(BlobError::InvalidKey {
                key: key.clone(),
                reason: "key does not name an object".into(),
            });
        }
        Ok(self.prefix.parts().chain(key_path.parts()).collect())
    }
}

#[async_trait::async_trait]
impl BlobSession for ObjectStoreSession {
    async fn open(&mut self, key: &BlobKey) -> Result<ScopedReader, BlobError> {
        let Some(store) = &self.store else {
            return Err(BlobError::Io {
                key: key.clone(),
                source: io::Error::other("session is closed"),
            });
        };
        let location = self.location(key)?;

        let result = store.get(&location).await.map_err(|err| match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound { key: key.clone() },
            err => BlobError::Backend(err),
        })?;
        let size = result.meta.size as u64;
        let stream = result.into_stream().map_err(io::Error::other);

        Ok(ScopedReader::new(key.clone(), StreamReader::new(stream)).with_size(size))
    }

    fn close(&mut self) {
        self.store = None;
    }
}
