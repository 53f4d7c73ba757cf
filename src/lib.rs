//! Streams the product photos of a tenant into a single zip archive.
//!
//! [`PhotoExporter`] ties the pieces together: the [`ProductPhotoLocator`] turns
//! product records into archive references, and the [`ArchiveAssembler`] copies
//! each referenced blob out of a [`BlobSource`] into the archive through a shared
//! [`BufferPool`].

pub mod assembler;
pub mod blobsource;
pub mod bufpool;
pub mod catalog;
pub mod config;
pub mod error;
pub mod exporter;
pub mod ledger;
pub mod locator;

pub use assembler::{ArchiveAssembler, Compression};
pub use blobsource::{BlobKey, BlobSession, BlobSource, ScopedReader};
pub use bufpool::BufferPool;
pub use error::{BlobError, ExportError};
pub use exporter::PhotoExporter;
pub use ledger::{EntryRecord, ExportResult, SkipReason, SkipRecord};
pub use locator::{
    LocatedPhoto, PhotoReference, ProductPhotoLocator, ProductRecord, ProductStore, TenantId,
};
