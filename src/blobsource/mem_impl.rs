use core::fmt;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio_util::io::StreamReader;

use super::*;

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// An in-memory blob source with open/close accounting and fault injection.
#[derive(Clone, Default)]
pub struct MemBlobSource {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    blobs: RwLock<HashMap<BlobKey, Bytes>>,
    faults: RwLock<Faults>,
    counters: Counters,
}

#[derive(Default)]
struct Faults {
    fail_session: bool,
    fail_open: HashSet<BlobKey>,
    /// Reads of these blobs fail after yielding the given number of bytes.
    fail_read_after: HashMap<BlobKey, usize>,
}

#[derive(Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    open_now: AtomicUsize,
    peak_open: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemSourceStats {
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub opens: usize,
    pub closes: usize,
    /// The most readers that were ever open at the same time.
    pub peak_open: usize,
}

impl MemBlobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<BlobKey>, contents: impl Into<Bytes>) {
        let mut blobs = self.shared.blobs.write().unwrap();
        blobs.insert(key.into(), contents.into());
    }

    pub fn len(&self) -> usize {
        self.shared.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.shared.faults.write().unwrap().fail_session = fail;
    }

    pub fn fail_open(&self, key: impl Into<BlobKey>) {
        let mut faults = self.shared.faults.write().unwrap();
        faults.fail_open.insert(key.into());
    }

    pub fn fail_read_after(&self, key: impl Into<BlobKey>, bytes: usize) {
        let mut faults = self.shared.faults.write().unwrap();
        faults.fail_read_after.insert(key.into(), bytes);
    }

    pub fn stats(&self) -> MemSourceStats {
        let counters = &self.shared.counters;
        MemSourceStats {
            sessions_opened: counters.sessions_opened.load(Ordering::SeqCst),
            sessions_closed: counters.sessions_closed.load(Ordering::SeqCst),
            opens: counters.opens.load(Ordering::SeqCst),
            closes: counters.closes.load(Ordering::SeqCst),
            peak_open: counters.peak_open.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for MemBlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlobSource")
            .field("blobs", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait::async_trait]
impl BlobSource for MemBlobSource {
    type Session = MemSession;

    async fn new_session(&self) -> Result<MemSession, BlobError> {
        if self.shared.faults.read().unwrap().fail_session {
            return Err(BlobError::Unavailable {
                location: "memory".into(),
                source: io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "injected session failure",
                ),
            });
        }
        self.shared
            .counters
            .sessions_opened
            .fetch_add(1, Ordering::SeqCst);

        Ok(MemSession {
            shared: Arc::clone(&self.shared),
            closed: false,
        })
    }
}

pub struct MemSession {
    shared: Arc<Shared>,
    closed: bool,
}

impl fmt::Debug for MemSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemSession")
            .field("closed", &self.closed)
            .finish()
    }
}

impl MemSession {
    fn reader_for(&self, key: &BlobKey) -> Result<(Bytes, Option<usize>), BlobError> {
        let faults = self.shared.faults.read().unwrap();
        if faults.fail_open.contains(key) {
            return Err(BlobError::Io {
                key: key.clone(),
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "injected open failure",
                ),
            });
        }
        let contents = self.shared.blobs.read().unwrap().get(key).cloned();
        let contents = contents.ok_or_else(|| BlobError::NotFound { key: key.clone() })?;

        Ok((contents, faults.fail_read_after.get(key).copied()))
    }
}

#[async_trait::async_trait]
impl BlobSession for MemSession {
    async fn open(&mut self, key: &BlobKey) -> Result<ScopedReader, BlobError> {
        if self.closed {
            return Err(BlobError::Io {
                key: key.clone(),
                source: io::Error::other("session is closed"),
            });
        }
        let (contents, fail_after) = self.reader_for(key)?;
        let size = contents.len() as u64;

        let stream = async_stream::stream! {
            let stop = fail_after.map_or(contents.len(), |limit| limit.min(contents.len()));
            let mut offset = 0;
            while offset < stop {
                let end = (offset + DEFAULT_CHUNK_SIZE).min(stop);
                yield Ok::<_, io::Error>(contents.slice(offset..end));
                offset = end;
            }
            if fail_after.is_some() {
                yield Err(io::Error::new(io::ErrorKind::UnexpectedEof, "injected read failure"));
            }
        };

        let counters = &self.shared.counters;
        counters.opens.fetch_add(1, Ordering::SeqCst);
        let open_now = counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_open.fetch_max(open_now, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let reader = ScopedReader::new(key.clone(), StreamReader::new(Box::pin(stream)))
            .with_size(size)
            .on_close(move || {
                shared.counters.open_now.fetch_sub(1, Ordering::SeqCst);
                shared.counters.closes.fetch_add(1, Ordering::SeqCst);
            });
        Ok(reader)
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.shared
                .counters
                .sessions_closed
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}
