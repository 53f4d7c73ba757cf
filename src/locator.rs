use core::fmt;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blobsource::BlobKey;
use crate::error::ExportError;
use crate::ledger::{SkipReason, SkipRecord};

/// Identifies the company whose photos are exported.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantId({:?})", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A product row as returned by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    #[serde(default)]
    pub photo_keys: Vec<String>,
}

impl ProductRecord {
    pub fn new<K: Into<String>>(
        id: impl Into<String>,
        photo_keys: impl IntoIterator<Item = K>,
    ) -> Self {
        Self {
            id: id.into(),
            photo_keys: photo_keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// The record query layer: lists a tenant's products in retrieval order.
#[async_trait::async_trait]
pub trait ProductStore: Send + Sync {
    async fn list_products_by_tenant(
        &self,
        tenant: &TenantId,
    ) -> anyhow::Result<Vec<ProductRecord>>;
}

/// Products held in memory, keyed by tenant.
#[derive(Debug, Clone, Default)]
pub struct MemProductStore {
    tenants: HashMap<TenantId, Vec<ProductRecord>>,
}

impl MemProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tenant: impl Into<TenantId>, product: ProductRecord) {
        self.tenants.entry(tenant.into()).or_default().push(product);
    }

    pub fn with_product(mut self, tenant: impl Into<TenantId>, product: ProductRecord) -> Self {
        self.insert(tenant, product);
        self
    }

    pub fn tenants(&self) -> impl Iterator<Item = &TenantId> {
        self.tenants.keys()
    }
}

#[async_trait::async_trait]
impl ProductStore for MemProductStore {
    async fn list_products_by_tenant(
        &self,
        tenant: &TenantId,
    ) -> anyhow::Result<Vec<ProductRecord>> {
        Ok(self.tenants.get(tenant).cloned().unwrap_or_default())
    }
}

/// One photo to put into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoReference {
    pub entry_name: String,
    pub blob_key: BlobKey,
}

/// A photo key as the locator saw it: either something to copy, or a photo
/// that was rejected before any storage access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatedPhoto {
    Reference(PhotoReference),
    Skipped(SkipRecord),
}

/// All photos of a tenant, in product order and then photo order.
#[derive(Debug, Default)]
pub struct Located {
    pub photos: Vec<LocatedPhoto>,
}

impl Located {
    pub fn references(&self) -> impl Iterator<Item = &PhotoReference> {
        self.photos.iter().filter_map(|photo| match photo {
            LocatedPhoto::Reference(reference) => Some(reference),
            LocatedPhoto::Skipped(_) => None,
        })
    }

    pub fn skips(&self) -> impl Iterator<Item = &SkipRecord> {
        self.photos.iter().filter_map(|photo| match photo {
            LocatedPhoto::Skipped(skip) => Some(skip),
            LocatedPhoto::Reference(_) => None,
        })
    }
}

pub struct ProductPhotoLocator<P> {
    products: P,
}

impl<P: ProductStore> ProductPhotoLocator<P> {
    pub fn new(products: P) -> Self {
        Self { products }
    }

    pub fn products(&self) -> &P {
        &self.products
    }

    /// Flattens all photo keys of the tenant's products, in product order and
    /// then photo order.
    ///
    /// Each key becomes a [`PhotoReference`] named `{productId}/{filename}`, where
    /// the filename is the last non-empty `/`-separated segment of the key.
    /// Keys that cannot be named that way stay in sequence as skips, named
    /// `{productId}/#{index}`:
    ///
    /// - an empty string is [`SkipReason::EmptyKey`],
    /// - a product id or filename that is empty, `.`, `..`, or contains a slash,
    ///   backslash or control character is [`SkipReason::InvalidName`].
    ///
    /// A tenant without products or photos yields an empty result, not an error.
    pub async fn locate(&self, tenant: &TenantId) -> Result<Located, ExportError> {
        let products = self
            .products
            .list_products_by_tenant(tenant)
            .await
            .map_err(|source| ExportError::ProductQuery {
                tenant: tenant.clone(),
                source,
            })?;

        let mut located = Located::default();
        let mut without_photos = 0;
        let mut skipped = 0;
        for product in products {
            if product.photo_keys.is_empty() {
                without_photos += 1;
                continue;
            }

            for (index, key) in product.photo_keys.into_iter().enumerate() {
                let blob_key = BlobKey::from(key);
                let photo = match entry_name(&product.id, &blob_key) {
                    Ok(entry_name) => LocatedPhoto::Reference(PhotoReference {
                        entry_name,
                        blob_key,
                    }),
                    Err((reason, detail)) => {
                        skipped += 1;
                        LocatedPhoto::Skipped(SkipRecord {
                            entry_name: format!("{}/#{index}", product.id),
                            blob_key,
                            reason,
                            detail: detail.into(),
                        })
                    }
                };
                located.photos.push(photo);
            }
        }

        debug!(
            tenant = %tenant,
            photos = located.photos.len(),
            skipped,
            without_photos,
            "located product photos"
        );
        Ok(located)
    }
}

fn entry_name(product_id: &str, key: &BlobKey) -> Result<String, (SkipReason, &'static str)> {
    if key.is_empty() {
        return Err((SkipReason::EmptyKey, "product lists an empty photo key"));
    }
    if !is_safe_segment(product_id) {
        return Err((
            SkipReason::InvalidName,
            "product id is not a usable directory name",
        ));
    }
    match original_filename(key) {
        Some(filename) if is_safe_segment(filename) => Ok(format!("{product_id}/{filename}")),
        Some(_) => Err((
            SkipReason::InvalidName,
            "photo key does not end in a usable file name",
        )),
        None => Err((SkipReason::InvalidName, "photo key has no file name")),
    }
}

/// The last non-empty `/`-separated segment of the key, if there is one.
fn original_filename(key: &BlobKey) -> Option<&str> {
    key.as_str().rsplit('/').find(|segment| !segment.is_empty())
}

/// Whether `segment` stays a single, literal path component when extracted.
fn is_safe_segment(segment: &str) -> bool {
    !matches!(segment, "" | "." | "..")
        && !segment.contains(['/', '\\'])
        && !segment.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait::async_trait]
    impl ProductStore for FailingStore {
        async fn list_products_by_tenant(
            &self,
            _tenant: &TenantId,
        ) -> anyhow::Result<Vec<ProductRecord>> {
            anyhow::bail!("record store is down")
        }
    }

    fn references(located: &Located) -> Vec<(&str, &str)> {
        located
            .references()
            .map(|r| (r.entry_name.as_str(), r.blob_key.as_str()))
            .collect()
    }

    fn skips(located: &Located) -> Vec<(&str, SkipReason)> {
        located
            .skips()
            .map(|s| (s.entry_name.as_str(), s.reason))
            .collect()
    }

    #[tokio::test]
    async fn flattens_in_product_then_photo_order() {
        let store = MemProductStore::new()
            .with_product(
                "T1",
                ProductRecord::new("p1", ["photos/p1/front.jpg", "photos/p1/back.jpg"]),
            )
            .with_product("T1", ProductRecord::new("p2", Vec::<String>::new()))
            .with_product("T1", ProductRecord::new("p3", ["side.png"]))
            .with_product("T2", ProductRecord::new("other", ["x.jpg"]));
        let locator = ProductPhotoLocator::new(store);

        let located = locator.locate(&"T1".into()).await.unwrap();
        assert_eq!(
            references(&located),
            [
                ("p1/front.jpg", "photos/p1/front.jpg"),
                ("p1/back.jpg", "photos/p1/back.jpg"),
                ("p3/side.png", "side.png"),
            ]
        );
        assert!(skips(&located).is_empty());
    }

    #[tokio::test]
    async fn empty_keys_are_skipped_before_io() {
        let store =
            MemProductStore::new().with_product("T2", ProductRecord::new("p1", ["k1", ""]));
        let locator = ProductPhotoLocator::new(store);

        let located = locator.locate(&"T2".into()).await.unwrap();
        assert_eq!(references(&located), [("p1/k1", "k1")]);
        assert_eq!(skips(&located), [("p1/#1", SkipReason::EmptyKey)]);
    }

    #[tokio::test]
    async fn skips_stay_in_photo_order() {
        let store = MemProductStore::new()
            .with_product("T1", ProductRecord::new("p1", ["a.jpg", ""]))
            .with_product("T1", ProductRecord::new("p2", ["", "b.jpg"]));
        let locator = ProductPhotoLocator::new(store);

        let located = locator.locate(&"T1".into()).await.unwrap();
        let order: Vec<_> = located
            .photos
            .iter()
            .map(|photo| match photo {
                LocatedPhoto::Reference(r) => r.entry_name.as_str(),
                LocatedPhoto::Skipped(s) => s.entry_name.as_str(),
            })
            .collect();
        assert_eq!(order, ["p1/a.jpg", "p1/#1", "p2/#0", "p2/b.jpg"]);
    }

    #[tokio::test]
    async fn unsafe_names_are_skipped_before_io() {
        let store = MemProductStore::new()
            .with_product("T1", ProductRecord::new("../../etc", ["a/passwd"]))
            .with_product("T1", ProductRecord::new("p/q", ["a.jpg"]))
            .with_product(
                "T1",
                ProductRecord::new("p1", ["a/..", "b/.", "/", "c\\..\\d.jpg", "ok.jpg", "  "]),
            );
        let locator = ProductPhotoLocator::new(store);

        let located = locator.locate(&"T1".into()).await.unwrap();
        assert_eq!(
            references(&located),
            [("p1/ok.jpg", "ok.jpg"), ("p1/  ", "  ")]
        );
        assert_eq!(
            skips(&located),
            [
                ("../../etc/#0", SkipReason::InvalidName),
                ("p/q/#0", SkipReason::InvalidName),
                ("p1/#0", SkipReason::InvalidName),
                ("p1/#1", SkipReason::InvalidName),
                ("p1/#2", SkipReason::InvalidName),
                ("p1/#3", SkipReason::InvalidName),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tenant_is_empty() {
        let locator = ProductPhotoLocator::new(MemProductStore::new());
        let located = locator.locate(&"nobody".into()).await.unwrap();
        assert!(located.photos.is_empty());
    }

    #[tokio::test]
    async fn query_failure_is_fatal() {
        let locator = ProductPhotoLocator::new(FailingStore);
        let err = locator.locate(&"T9".into()).await.unwrap_err();
        assert!(matches!(err, ExportError::ProductQuery { .. }));
        assert_eq!(err.tenant().as_str(), "T9");
    }

    #[test]
    fn filename_is_last_segment() {
        assert_eq!(original_filename(&"a/b/c.jpg".into()), Some("c.jpg"));
        assert_eq!(original_filename(&"a/b/".into()), Some("b"));
        assert_eq!(original_filename(&"c.jpg".into()), Some("c.jpg"));
        assert_eq!(original_filename(&" ".into()), Some(" "));
        assert_eq!(original_filename(&"".into()), None);
        assert_eq!(original_filename(&"//".into()), None);
    }

    #[test]
    fn safe_segments() {
        assert!(is_safe_segment("p1"));
        assert!(is_safe_segment("front.jpg"));
        assert!(is_safe_segment("..hidden"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment("."));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment("a\\b"));
        assert!(!is_safe_segment("a\nb"));
    }
}
