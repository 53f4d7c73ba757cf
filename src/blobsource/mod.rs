use core::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

pub use crate::error::BlobError;

pub mod fs_impl;
pub mod mem_impl;
pub mod object_store_impl;

pub use fs_impl::FsBlobSource;
pub use mem_impl::MemBlobSource;
pub use object_store_impl::ObjectStoreBlobSource;

/// The storage path of one blob, relative to the root of its [`BlobSource`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({:?})", self.0)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for BlobKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A storage backend that blobs can be streamed out of.
///
/// All reads for one export go through a single [`BlobSession`], which is opened
/// once up front and closed once after the last entry.
#[async_trait::async_trait]
pub trait BlobSource: Send + Sync {
    type Session: BlobSession;

    async fn new_session(&self) -> Result<Self::Session, BlobError>;
}

#[async_trait::async_trait]
pub trait BlobSession: Send {
    /// Opens a live stream over the blob stored at `key`.
    ///
    /// Returns [`BlobError::NotFound`] if there is no such blob.
    async fn open(&mut self, key: &BlobKey) -> Result<ScopedReader, BlobError>;

    /// Releases the backend resources held by this session. Idempotent.
    fn close(&mut self);
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// An open stream over a single blob.
///
/// The underlying reader is released by [`close`](Self::close), or on drop if it
/// was never closed explicitly, so every successful open is paired with exactly
/// one release.
pub struct ScopedReader {
    key: BlobKey,
    size: Option<u64>,
    inner: Option<BoxedRead>,
    on_close: Option<CloseHook>,
}

impl ScopedReader {
    pub fn new(key: BlobKey, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            key,
            size: None,
            inner: Some(Box::new(reader)),
            on_close: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Registers a callback that runs once, when the reader is released.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            if let Some(hook) = self.on_close.take() {
                hook();
            }
        }
    }
}

impl AsyncRead for ScopedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::other(format!(
                "reader for blob `{}` is already closed",
                this.key
            )))),
        }
    }
}

impl Drop for ScopedReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ScopedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedReader")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Either of the persistent backends, picked at runtime from configuration.
#[derive(Debug)]
pub enum StorageSource {
    Fs(FsBlobSource),
    ObjectStore(ObjectStoreBlobSource),
}

#[derive(Debug)]
pub enum StorageSession {
    Fs(fs_impl::FsSession),
    ObjectStore(object_store_impl::ObjectStoreSession),
}

impl StorageSource {
    /// Interprets `location` as an object store URL if it has a scheme
    /// (`file:///…`, `memory:///`, `s3://…`), and as a local directory otherwise.
    pub fn from_location(location: &str) -> Result<Self, BlobError> {
        if location.contains("://") {
            ObjectStoreBlobSource::from_url(location).map(Self::ObjectStore)
        } else {
            Ok(Self::Fs(FsBlobSource::new(location)))
        }
    }
}

#[async_trait::async_trait]
impl BlobSource for StorageSource {
    type Session = StorageSession;

    async fn new_session(&self) -> Result<StorageSession, BlobError> {
        Ok(match self {
            Self::Fs(source) => StorageSession::Fs(source.new_session().await?),
            Self::ObjectStore(source) => StorageSession::ObjectStore(source.new_session().await?),
        })
    }
}

#[async_trait::async_trait]
impl BlobSession for StorageSession {
    async fn open(&mut self, key: &BlobKey) -> Result<ScopedReader, BlobError> {
        match self {
            Self::Fs(session) => session.open(key).await,
            Self::ObjectStore(session) => session.open(key).await,
        }
    }

    fn close(&mut self) {
        match self {
            Self::Fs(session) => session.close(),
            Self::ObjectStore(session) => session.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn scoped_reader_closes_exactly_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let hook_closes = Arc::clone(&closes);

        let mut reader = ScopedReader::new(BlobKey::from("a/b.jpg"), &b"contents"[..])
            .with_size(8)
            .on_close(move || {
                hook_closes.fetch_add(1, Ordering::SeqCst);
            });

        let mut read = String::new();
        reader.read_to_string(&mut read).await.unwrap();
        assert_eq!(read, "contents");

        reader.close();
        reader.close();
        assert!(reader.is_closed());
        assert!(reader.read(&mut [0; 4]).await.is_err());

        drop(reader);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_an_open_reader_closes_it() {
        let closes = Arc::new(AtomicUsize::new(0));
        let hook_closes = Arc::clone(&closes);

        let reader = ScopedReader::new(BlobKey::from("k"), &b""[..]).on_close(move || {
            hook_closes.fetch_add(1, Ordering::SeqCst);
        });
        drop(reader);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn picks_backend_from_location() {
        assert!(matches!(
            StorageSource::from_location("/var/lib/photos").unwrap(),
            StorageSource::Fs(_)
        ));
        assert!(matches!(
            StorageSource::from_location("memory:///").unwrap(),
            StorageSource::ObjectStore(_)
        ));
        assert!(StorageSource::from_location("bogus-scheme://x").is_err());
    }

    #[test]
    fn only_the_empty_string_is_an_empty_key() {
        assert!(BlobKey::from("").is_empty());
        assert!(!BlobKey::from("  ").is_empty());
        assert!(!BlobKey::from("a.jpg").is_empty());
    }
}
