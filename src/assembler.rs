use std::collections::HashSet;
use std::io::{self, Seek, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::blobsource::{BlobSession, BlobSource, ScopedReader};
use crate::bufpool::BufferPool;
use crate::error::ExportError;
use crate::ledger::{EntryRecord, ExportResult, SkipReason, SkipRecord};
use crate::locator::{LocatedPhoto, PhotoReference, TenantId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Photos are already compressed, so they are stored as-is by default.
    #[default]
    Stored,
    Deflated,
}

impl Compression {
    fn method(self) -> CompressionMethod {
        match self {
            Self::Stored => CompressionMethod::Stored,
            Self::Deflated => CompressionMethod::Deflated,
        }
    }
}

/// Streams blobs into a zip archive, one entry at a time.
///
/// At most one blob reader and one pooled buffer are held at any point of an
/// export. A blob that cannot be opened or read is recorded as a [`SkipRecord`]
/// and the export carries on; only failing to open the storage session or to
/// finalize the archive aborts it.
///
/// An entry whose copy fails midway is removed from the archive again, so an
/// archive never contains truncated photos.
pub struct ArchiveAssembler<S> {
    source: S,
    pool: Arc<BufferPool>,
    compression: Compression,
}

impl<S: BlobSource> ArchiveAssembler<S> {
    pub fn new(source: S, pool: Arc<BufferPool>) -> Self {
        Self {
            source,
            pool,
            compression: Compression::default(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn entry_options(&self) -> SimpleFileOptions {
        // a fixed timestamp keeps archives reproducible for identical input
        SimpleFileOptions::default()
            .compression_method(self.compression.method())
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644)
    }

    /// Writes every located photo into a new archive on `sink`.
    ///
    /// Photos that were already skipped by the locator are carried over into the
    /// result at their position, so the skips come out in the order of `photos`.
    pub async fn assemble<W>(
        &self,
        tenant: &TenantId,
        photos: Vec<LocatedPhoto>,
        sink: W,
    ) -> Result<ExportResult<W>, ExportError>
    where
        W: Write + Seek + Send,
    {
        let session = self.source.new_session().await.map_err(|source| {
            error!(tenant = %tenant, error = %source, "cannot open storage session");
            ExportError::SessionOpen {
                tenant: tenant.clone(),
                source,
            }
        })?;
        let mut session = SessionGuard::new(session);

        let options = self.entry_options();
        let mut writer = ZipWriter::new(sink);
        let mut names = EntryNames::default();
        let mut entries = Vec::with_capacity(photos.len());
        let mut skips = Vec::new();

        for photo in photos {
            let PhotoReference {
                entry_name,
                blob_key,
            } = match photo {
                LocatedPhoto::Reference(reference) => reference,
                LocatedPhoto::Skipped(skip) => {
                    log_skip(tenant, &skip);
                    skips.push(skip);
                    continue;
                }
            };

            let mut reader = match session.open(&blob_key).await {
                Ok(reader) => reader,
                Err(err) => {
                    let skip = SkipRecord {
                        entry_name,
                        blob_key,
                        reason: SkipReason::OpenFailed,
                        detail: err.to_string(),
                    };
                    log_skip(tenant, &skip);
                    skips.push(skip);
                    continue;
                }
            };

            let entry_name = names.claim(&entry_name);
            let copied = self
                .copy_entry(&mut writer, &entry_name, options, &mut reader)
                .await;
            reader.close();

            match copied {
                Ok((size, digest)) => {
                    debug!(tenant = %tenant, entry = %entry_name, size, "wrote archive entry");
                    entries.push(EntryRecord {
                        entry_name,
                        blob_key,
                        size,
                        digest,
                    });
                }
                Err(err) => {
                    let removed = !err.entry_started()
                        || match writer.abort_file() {
                            Ok(()) => true,
                            Err(abort_err) => {
                                warn!(
                                    tenant = %tenant,
                                    entry = %entry_name,
                                    error = %abort_err,
                                    "cannot remove partial archive entry"
                                );
                                false
                            }
                        };
                    // a partial entry that could not be removed keeps its name
                    if removed {
                        names.release(&entry_name);
                    }
                    let skip = SkipRecord {
                        entry_name,
                        blob_key,
                        reason: SkipReason::CopyFailed,
                        detail: err.to_string(),
                    };
                    log_skip(tenant, &skip);
                    skips.push(skip);
                }
            }
        }

        let archive = writer.finish().map_err(|source| {
            error!(tenant = %tenant, error = %source, "cannot finalize archive");
            ExportError::Finalize {
                tenant: tenant.clone(),
                source,
            }
        })?;
        session.close();

        Ok(ExportResult::new(archive, entries, skips))
    }

    async fn copy_entry<W: Write + Seek>(
        &self,
        writer: &mut ZipWriter<W>,
        entry_name: &str,
        options: SimpleFileOptions,
        reader: &mut ScopedReader,
    ) -> Result<(u64, blake3::Hash), CopyError> {
        writer
            .start_file(entry_name, options)
            .map_err(CopyError::Start)?;

        let mut buf = self.pool.acquire();
        let mut hasher = blake3::Hasher::new();
        let mut size = 0;
        loop {
            let read = reader.read(&mut buf[..]).await.map_err(CopyError::Read)?;
            if read == 0 {
                break;
            }
            let chunk = &buf[..read];
            writer.write_all(chunk).map_err(CopyError::Write)?;
            hasher.update(chunk);
            size += read as u64;
        }

        Ok((size, hasher.finalize()))
    }
}

fn log_skip(tenant: &TenantId, skip: &SkipRecord) {
    warn!(
        tenant = %tenant,
        entry = %skip.entry_name,
        reason = %skip.reason,
        "skipping photo: {}",
        skip.detail
    );
}

#[derive(Debug, thiserror::Error)]
enum CopyError {
    #[error("cannot create archive entry: {0}")]
    Start(zip::result::ZipError),
    #[error("reading blob failed: {0}")]
    Read(io::Error),
    #[error("writing archive entry failed: {0}")]
    Write(io::Error),
}

impl CopyError {
    fn entry_started(&self) -> bool {
        !matches!(self, Self::Start(_))
    }
}

/// Closes the session on every exit path, including early returns and a
/// dropped export future.
struct SessionGuard<T: BlobSession> {
    session: T,
    closed: bool,
}

impl<T: BlobSession> SessionGuard<T> {
    fn new(session: T) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            self.session.close();
        }
    }
}

impl<T: BlobSession> Deref for SessionGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.session
    }
}

impl<T: BlobSession> DerefMut for SessionGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.session
    }
}

impl<T: BlobSession> Drop for SessionGuard<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hands out unique entry names, suffixing `-1`, `-2`, … before the
/// extension when a name is already taken. A name whose entry was abandoned
/// is released again.
#[derive(Default)]
struct EntryNames(HashSet<String>);

impl EntryNames {
    fn claim(&mut self, wanted: &str) -> String {
        if self.0.insert(wanted.to_owned()) {
            return wanted.to_owned();
        }

        let (stem, extension) = split_extension(wanted);
        let mut n = 1;
        loop {
            let candidate = format!("{stem}-{n}{extension}");
            if self.0.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    fn release(&mut self, name: &str) {
        self.0.remove(name);
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    let filename_start = name.rfind('/').map_or(0, |idx| idx + 1);
    match name[filename_start..].rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => name.split_at(filename_start + dot),
    }
}
