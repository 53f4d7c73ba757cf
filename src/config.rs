use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::assembler::Compression;
use crate::blobsource::StorageSource;
use crate::bufpool::{BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE};

const ENV_PREFIX: &str = "PHOTOZIP_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub listen_addr: String,
    pub storage: StorageConfig,
    /// JSON file with the product records of every tenant.
    pub catalog_path: PathBuf,
    pub buffer_size: usize,
    pub max_idle_buffers: usize,
    pub compression: Compression,
    /// Where the download endpoint sends the client when an export fails.
    pub error_redirect: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// A local directory, or an object store URL (`file:///…`, `s3://bucket/prefix`).
    pub url: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8090".into(),
            storage: StorageConfig::default(),
            catalog_path: PathBuf::from("photozip_storage/catalog.json"),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_idle_buffers: DEFAULT_MAX_IDLE,
            compression: Compression::default(),
            error_redirect: "/login".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "photozip_storage/blobs".into(),
        }
    }
}

impl ExportConfig {
    /// Defaults, overridden by the YAML file at `path` (if any), overridden by
    /// `PHOTOZIP_*` environment variables (`PHOTOZIP_STORAGE__URL` for nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let yaml = path
            .map(|path| {
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config `{}`", path.display()))
            })
            .transpose()?;

        let config: ExportConfig = Self::figment(yaml.as_deref())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(yaml: Option<&str>) -> Figment {
        let figment = Figment::from(Serialized::defaults(ExportConfig::default()));
        match yaml {
            Some(yaml) => figment.merge(Yaml::string(yaml)),
            None => figment,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be greater than zero");
        }
        if self.storage.url.trim().is_empty() {
            anyhow::bail!("storage.url must not be empty");
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address: {}", self.listen_addr))?;
        Ok(())
    }

    pub fn buffer_pool(&self) -> BufferPool {
        BufferPool::new(self.buffer_size, self.max_idle_buffers)
    }

    pub fn blob_source(&self) -> Result<StorageSource> {
        StorageSource::from_location(&self.storage.url)
            .with_context(|| format!("invalid storage location `{}`", self.storage.url))
    }
}
