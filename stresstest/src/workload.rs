use std::sync::Arc;
use std::thread::available_parallelism;

use photozip::blobsource::MemBlobSource;
use photozip::locator::MemProductStore;
use photozip::{BufferPool, Compression, PhotoExporter, ProductRecord, TenantId};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal};

pub type Exporter = PhotoExporter<MemProductStore, MemBlobSource>;

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,
    compression: Compression,

    tenants: usize,
    products_per_tenant: usize,
    max_photos_per_product: usize,

    p50_size: u64,
    p99_size: u64,

    present_weight: u8,
    missing_weight: u8,
    empty_weight: u8,
}

impl WorkloadBuilder {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn catalog(mut self, tenants: usize, products: usize, max_photos: usize) -> Self {
        self.tenants = tenants;
        self.products_per_tenant = products;
        self.max_photos_per_product = max_photos;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    /// Relative weights of photo keys that exist, are missing from storage, or are empty.
    pub fn key_weights(mut self, present: u8, missing: u8, empty: u8) -> Self {
        self.present_weight = present;
        self.missing_weight = missing;
        self.empty_weight = empty;
        self
    }

    /// Generates the catalog and blobs, and wires them into an exporter that
    /// uses the shared `pool`.
    pub fn build(self, pool: Arc<BufferPool>) -> Workload {
        let mut rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma).unwrap();
        let key_distribution =
            WeightedIndex::new([self.present_weight, self.missing_weight, self.empty_weight])
                .unwrap();

        let source = MemBlobSource::new();
        let mut products = MemProductStore::new();
        let mut tenants = Vec::with_capacity(self.tenants);
        let mut stored_bytes = 0;

        for t in 0..self.tenants {
            let tenant = TenantId::new(format!("{}-{t}", self.name));
            for p in 0..self.products_per_tenant {
                let photos = rng.random_range(0..=self.max_photos_per_product);
                let keys: Vec<String> = (0..photos)
                    .map(|i| {
                        let key = format!("{tenant}/{p}/{i}.jpg");
                        match key_distribution.sample(&mut rng) {
                            0 => {
                                let len = size_distribution.sample(&mut rng) as usize;
                                let mut contents = vec![0; len];
                                rng.fill_bytes(&mut contents);
                                stored_bytes += len as u64;
                                source.insert(key.as_str(), contents);
                                key
                            }
                            1 => key,
                            _ => String::new(),
                        }
                    })
                    .collect();
                products.insert(tenant.clone(), ProductRecord::new(format!("p{p}"), keys));
            }
            tenants.push(tenant);
        }

        let exporter =
            PhotoExporter::new(products, source.clone(), pool).with_compression(self.compression);

        Workload {
            config: WorkloadConfig {
                name: self.name,
                concurrency: self.concurrency,
                compression: self.compression,
                p50_size: self.p50_size,
                p99_size: self.p99_size,
                blobs: source.len(),
                stored_bytes,
            },
            rng,
            tenants,
            exporter: Arc::new(exporter),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub compression: Compression,
    pub p50_size: u64,
    pub p99_size: u64,
    pub blobs: usize,
    pub stored_bytes: u64,
}

pub struct Workload {
    pub config: WorkloadConfig,

    /// The RNG picking which tenant to export next.
    rng: SmallRng,
    tenants: Vec<TenantId>,

    pub exporter: Arc<Exporter>,
    /// Kept around to inspect the session and reader counters afterwards.
    pub source: MemBlobSource,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().unwrap().get(),
            seed: rand::random(),
            compression: Compression::Stored,

            tenants: 8,
            products_per_tenant: 20,
            max_photos_per_product: 4,

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,

            present_weight: 90,
            missing_weight: 8,
            empty_weight: 2,
        }
    }

    pub fn next_tenant(&mut self) -> TenantId {
        let idx = self.rng.random_range(0..self.tenants.len());
        self.tenants[idx].clone()
    }
}
