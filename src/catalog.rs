use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::locator::{ProductRecord, ProductStore, TenantId};

/// Product records read from a JSON file that maps tenant ids to their products:
///
/// ```json
/// { "acme": [{ "id": "p1", "photo_keys": ["photos/p1/front.jpg"] }] }
/// ```
///
/// The file is re-read on every query, so edits show up in the next export.
#[derive(Debug, Clone)]
pub struct CatalogFile {
    path: PathBuf,
}

impl CatalogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ProductStore for CatalogFile {
    async fn list_products_by_tenant(
        &self,
        tenant: &TenantId,
    ) -> anyhow::Result<Vec<ProductRecord>> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read catalog `{}`", self.path.display()))?;
        let mut tenants: HashMap<TenantId, Vec<ProductRecord>> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse catalog `{}`", self.path.display()))?;

        Ok(tenants.remove(tenant).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_products_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{
                "acme": [
                    { "id": "p2", "photo_keys": ["b.jpg", ""] },
                    { "id": "p1" }
                ],
                "globex": [{ "id": "g1", "photo_keys": ["g.jpg"] }]
            }"#,
        )
        .unwrap();

        let catalog = CatalogFile::new(&path);
        let products = catalog.list_products_by_tenant(&"acme".into()).await.unwrap();
        assert_eq!(
            products,
            [
                ProductRecord::new("p2", ["b.jpg", ""]),
                ProductRecord::new("p1", Vec::<String>::new()),
            ]
        );

        let products = catalog.list_products_by_tenant(&"initech".into()).await.unwrap();
        assert!(products.is_empty());
    }

    #[tokio::test]
    async fn unreadable_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = CatalogFile::new(dir.path().join("missing.json"));
        assert!(catalog.list_products_by_tenant(&"acme".into()).await.is_err());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();
        let catalog = CatalogFile::new(path);
        assert!(catalog.list_products_by_tenant(&"acme".into()).await.is_err());
    }
}
