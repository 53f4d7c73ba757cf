use std::io;

use crate::blobsource::BlobKey;
use crate::locator::TenantId;

/// Failures of a single blob source operation.
///
/// Opening or reading an individual blob only ever costs that one archive
/// entry; only a failure to open the session is fatal for an export.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob `{key}` not found")]
    NotFound { key: BlobKey },

    #[error("invalid blob key `{key}`: {reason}")]
    InvalidKey { key: BlobKey, reason: String },

    #[error("I/O error on blob `{key}`: {source}")]
    Io {
        key: BlobKey,
        #[source]
        source: io::Error,
    },

    #[error("storage at `{location}` is unavailable: {source}")]
    Unavailable {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),
}

impl BlobError {
    pub(crate) fn from_io(key: &BlobKey, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { key: key.clone() }
        } else {
            Self::Io {
                key: key.clone(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// An error that aborts a whole export. Always carries the tenant it happened for.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export for tenant `{tenant}`: cannot open storage session: {source}")]
    SessionOpen {
        tenant: TenantId,
        #[source]
        source: BlobError,
    },

    #[error("export for tenant `{tenant}`: product query failed: {source}")]
    ProductQuery {
        tenant: TenantId,
        #[source]
        source: anyhow::Error,
    },

    #[error("export for tenant `{tenant}`: cannot finalize archive: {source}")]
    Finalize {
        tenant: TenantId,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("export for tenant `{tenant}`: cannot spool archive: {source}")]
    Spool {
        tenant: TenantId,
        #[source]
        source: io::Error,
    },
}

impl ExportError {
    pub fn tenant(&self) -> &TenantId {
        match self {
            Self::SessionOpen { tenant, .. }
            | Self::ProductQuery { tenant, .. }
            | Self::Finalize { tenant, .. }
            | Self::Spool { tenant, .. } => tenant,
        }
    }
}
