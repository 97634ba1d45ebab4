use std::{env, fmt::Debug, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use metrics::{blob_storage, Timer};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    parse_url,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    PutPayload,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobStorageConfig {
    #[serde(default = "default_blob_store_path")]
    pub path: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Issue unsigned requests. Required for the public NEXRAD buckets.
    #[serde(default)]
    pub skip_signature: bool,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            region: None,
            skip_signature: false,
        }
    }

    /// Config for a public, anonymously readable S3 bucket.
    pub fn public_s3(bucket: &str, region: &str) -> Self {
        BlobStorageConfig {
            path: format!("s3://{}", bucket),
            region: Some(region.to_string()),
            skip_signature: true,
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig {
            path: default_blob_store_path(),
            region: None,
            skip_signature: false,
        }
    }
}

fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .expect("unable to get current directory")
            .join("radar_storage/blobs")
            .to_str()
            .expect("unable to get path as string")
    )
}

/// Key/value view over an [`ObjectStore`] rooted at the configured path.
///
/// Keys are `/` separated and relative to the root; the same keys come back
/// from [`BlobStorage::list`].
#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    url: String,
    metrics: Arc<blob_storage::Metrics>,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage").field("url", &self.url).finish()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        debug!("using blob store path: {}", config.path);
        let (object_store, path) = Self::build_object_store(&config)?;
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
            url: config.path,
            metrics: Arc::new(blob_storage::Metrics::new()),
        })
    }

    pub fn build_object_store(config: &BlobStorageConfig) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = config
            .path
            .parse::<Url>()
            .with_context(|| format!("invalid blob store url: {}", config.path))?;
        let (scheme, path) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                let mut s3_builder = AmazonS3Builder::new().with_url(config.path.as_str());
                if !config.skip_signature {
                    // inject AWS environment variables to prioritize keys over instance metadata
                    // credentials.
                    for (key, value) in aws_env_options() {
                        s3_builder = s3_builder.with_config(key, value);
                    }
                }
                if let Some(region) = &config.region {
                    s3_builder = s3_builder.with_region(region);
                }
                let s3 = s3_builder
                    .with_skip_signature(config.skip_signature)
                    .build()
                    .context("failed to create s3 object store")?;
                Ok((Box::new(s3), path))
            }
            _ => Ok(parse_url(&url)?),
        }
    }

    pub fn get_url(&self) -> &str {
        &self.url
    }

    fn key_path(&self, key: &str) -> Path {
        Path::from(format!("{}/{}", self.path, key))
    }

    fn relative_key(&self, location: &Path) -> Option<String> {
        location.prefix_match(&self.path).map(|parts| {
            parts
                .map(|part| part.as_ref().to_string())
                .collect::<Vec<_>>()
                .join("/")
        })
    }

    /// Reads a whole object. A missing key is `Ok(None)`.
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let timer_kvs = &[KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let path = self.key_path(key);
        match self.object_store.get(&path).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .with_context(|| format!("error reading object {}", path))?;
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("can't get object {}", path))),
        }
    }

    /// Writes `data` under `key`, replacing any existing object.
    pub async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "put")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let path = self.key_path(key);
        self.object_store
            .put(&path, PutPayload::from(data))
            .await
            .with_context(|| format!("can't put object {}", path))?;
        Ok(())
    }

    /// Lists every key below `prefix`, relative to the storage root.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let timer_kvs = &[KeyValue::new("op", "list")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let prefix_path = self.key_path(prefix);
        let objects: Vec<_> = self
            .object_store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .with_context(|| format!("can't list objects under {}", prefix_path))?;
        let mut keys: Vec<String> = objects
            .iter()
            .filter_map(|meta| self.relative_key(&meta.location))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Deletes `key`. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);

        let path = self.key_path(key);
        match self.object_store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("can't delete object {}", path))),
        }
    }
}

fn aws_env_options() -> Vec<(AmazonS3ConfigKey, String)> {
    std::env::vars_os()
        .filter_map(|(os_key, os_value)| {
            if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                if key.starts_with("AWS_") {
                    if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                        return Some((config_key, String::from(value)));
                    }
                }
            }
            None
        })
        .collect()
}
