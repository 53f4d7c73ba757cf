use std::fs::File;
use std::io::{Cursor, Seek, Write};
use std::sync::Arc;

use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::assembler::{ArchiveAssembler, Compression};
use crate::blobsource::BlobSource;
use crate::bufpool::BufferPool;
use crate::error::ExportError;
use crate::ledger::ExportResult;
use crate::locator::{ProductPhotoLocator, ProductStore, TenantId};

/// Exports all product photos of a tenant as one zip archive.
///
/// Cheap to share between concurrent requests: every call opens its own
/// storage session, and only the buffer pool is shared.
pub struct PhotoExporter<P, S> {
    locator: ProductPhotoLocator<P>,
    assembler: ArchiveAssembler<S>,
}

impl<P: ProductStore, S: BlobSource> PhotoExporter<P, S> {
    pub fn new(products: P, source: S, pool: Arc<BufferPool>) -> Self {
        Self {
            locator: ProductPhotoLocator::new(products),
            assembler: ArchiveAssembler::new(source, pool),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.assembler = self.assembler.with_compression(compression);
        self
    }

    pub fn locator(&self) -> &ProductPhotoLocator<P> {
        &self.locator
    }

    pub fn assembler(&self) -> &ArchiveAssembler<S> {
        &self.assembler
    }

    pub async fn export<W>(
        &self,
        tenant: &TenantId,
        sink: W,
    ) -> Result<ExportResult<W>, ExportError>
    where
        W: Write + Seek + Send,
    {
        let export_id = Uuid::new_v4();
        let span = info_span!("export", tenant = %tenant, %export_id);

        async move {
            let located = self.locator.locate(tenant).await?;
            let result = self
                .assembler
                .assemble(tenant, located.photos, sink)
                .await?;

            info!(
                entries = result.entries_written(),
                skipped = result.skips().len(),
                bytes = result.bytes_copied(),
                "export finished"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Builds the archive in memory.
    pub async fn export_to_vec(
        &self,
        tenant: &TenantId,
    ) -> Result<ExportResult<Vec<u8>>, ExportError> {
        let result = self.export(tenant, Cursor::new(Vec::new())).await?;
        Ok(result.map_archive(Cursor::into_inner))
    }

    /// Spools the archive into an anonymous temporary file, rewound to the start.
    pub async fn export_to_tempfile(
        &self,
        tenant: &TenantId,
    ) -> Result<ExportResult<File>, ExportError> {
        let spool_error = |source| ExportError::Spool {
            tenant: tenant.clone(),
            source,
        };

        let mut file = tempfile::tempfile().map_err(spool_error)?;
        let summary = self.export(tenant, &mut file).await?.map_archive(|_| ());
        file.rewind().map_err(spool_error)?;

        Ok(summary.map_archive(|()| file))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::blobsource::MemBlobSource;
    use crate::locator::{MemProductStore, ProductRecord};

    #[tokio::test]
    async fn tempfile_and_vec_exports_match() {
        let source = MemBlobSource::new();
        source.insert("photos/a.jpg", "A");
        source.insert("photos/b.jpg", "BB");
        let products = MemProductStore::new()
            .with_product("T1", ProductRecord::new("p1", ["photos/a.jpg"]))
            .with_product("T1", ProductRecord::new("p2", ["photos/b.jpg"]));
        let exporter = PhotoExporter::new(products, source, Arc::default());

        let in_memory = exporter.export_to_vec(&"T1".into()).await.unwrap();
        let spooled = exporter.export_to_tempfile(&"T1".into()).await.unwrap();
        assert_eq!(spooled.entries(), in_memory.entries());

        let mut spooled_bytes = vec![];
        spooled
            .into_archive()
            .read_to_end(&mut spooled_bytes)
            .unwrap();
        assert_eq!(spooled_bytes, in_memory.into_archive());
    }
}
