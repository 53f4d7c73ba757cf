use core::fmt;

use crate::blobsource::BlobKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The product listed an empty photo key; storage was never touched.
    EmptyKey,
    /// The product id or the key's file name cannot be used as an archive path
    /// (such as `..` or a name containing a backslash); storage was never touched.
    InvalidName,
    /// The blob could not be opened (missing, unreadable, invalid key).
    OpenFailed,
    /// The blob opened, but reading it or writing the entry failed midway.
    CopyFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyKey => "empty-key",
            Self::InvalidName => "invalid-name",
            Self::OpenFailed => "open-failed",
            Self::CopyFailed => "copy-failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A photo that was left out of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRecord {
    pub entry_name: String,
    pub blob_key: BlobKey,
    pub reason: SkipReason,
    pub detail: String,
}

/// A photo that made it into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub entry_name: String,
    pub blob_key: BlobKey,
    pub size: u64,
    pub digest: blake3::Hash,
}

impl EntryRecord {
    pub fn digest_hex(&self) -> String {
        base16ct::lower::encode_string(self.digest.as_bytes())
    }
}

/// The outcome of one export: the finished archive and what went into it.
#[derive(Debug)]
pub struct ExportResult<W> {
    archive: W,
    entries: Vec<EntryRecord>,
    skips: Vec<SkipRecord>,
}

impl<W> ExportResult<W> {
    pub(crate) fn new(archive: W, entries: Vec<EntryRecord>, skips: Vec<SkipRecord>) -> Self {
        Self {
            archive,
            entries,
            skips,
        }
    }

    pub fn archive(&self) -> &W {
        &self.archive
    }

    pub fn into_archive(self) -> W {
        self.archive
    }

    pub fn entries_written(&self) -> usize {
        self.entries.len()
    }

    /// The written entries, in archive order.
    pub fn entries(&self) -> &[EntryRecord] {
        &self.entries
    }

    /// Photos that were skipped, in the order they were encountered.
    pub fn skips(&self) -> &[SkipRecord] {
        &self.skips
    }

    pub fn bytes_copied(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum()
    }

    pub fn map_archive<U>(self, f: impl FnOnce(W) -> U) -> ExportResult<U> {
        ExportResult {
            archive: f(self.archive),
            entries: self.entries,
            skips: self.skips,
        }
    }
}
