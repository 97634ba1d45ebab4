use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use blob_store::BlobStorage;
use bytes::Bytes;
use data_model::{FileIndex, Level, ProductCodeRegistry, UpdateFlags};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::PipelineError;

/// In-memory copy of the index documents for one `(level, product)`.
///
/// The registry and flag documents are shared by every product; a snapshot
/// holds them whole so a commit writes them back whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub level: Level,
    pub product: String,
    pub files: FileIndex,
    pub registry: ProductCodeRegistry,
    pub flags: UpdateFlags,
}

impl IndexSnapshot {
    pub fn empty(level: Level, product: &str) -> Self {
        Self {
            level,
            product: product.to_string(),
            files: FileIndex::default(),
            registry: ProductCodeRegistry::default(),
            flags: UpdateFlags::default(),
        }
    }
}

#[async_trait]
pub trait IndexRepository: Send + Sync {
    async fn load(&self, level: Level, product: &str) -> Result<IndexSnapshot>;

    /// Persists a snapshot: file list first, then registry, then flags. A
    /// failure part way leaves the earlier documents written.
    async fn commit(&self, snapshot: &IndexSnapshot) -> Result<(), PipelineError>;
}

/// Keeps the index documents as JSON blobs next to the artifacts.
pub struct BlobIndexRepository {
    storage: Arc<BlobStorage>,
}

impl BlobIndexRepository {
    pub fn new(storage: Arc<BlobStorage>) -> Self {
        Self { storage }
    }

    async fn read_document<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.storage.get_bytes(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt index document {}", key)),
            None => {
                debug!(key, "index document missing, starting empty");
                Ok(T::default())
            }
        }
    }

    async fn write_document<T: Serialize>(&self, key: &str, document: &T) -> Result<(), PipelineError> {
        let to_consistency = |source: anyhow::Error| PipelineError::Consistency {
            document: key.to_string(),
            source,
        };
        let bytes = serde_json::to_vec(document).map_err(|e| to_consistency(e.into()))?;
        self.storage
            .put_bytes(key, Bytes::from(bytes))
            .await
            .map_err(to_consistency)?;
        Ok(())
    }
}

#[async_trait]
impl IndexRepository for BlobIndexRepository {
    async fn load(&self, level: Level, product: &str) -> Result<IndexSnapshot> {
        let files = self.read_document(&FileIndex::key(level, product)).await?;
        let registry = self.read_document(ProductCodeRegistry::KEY).await?;
        let flags = self.read_document(UpdateFlags::KEY).await?;
        Ok(IndexSnapshot {
            level,
            product: product.to_string(),
            files,
            registry,
            flags,
        })
    }

    async fn commit(&self, snapshot: &IndexSnapshot) -> Result<(), PipelineError> {
        self.write_document(
            &FileIndex::key(snapshot.level, &snapshot.product),
            &snapshot.files,
        )
        .await?;
        self.write_document(ProductCodeRegistry::KEY, &snapshot.registry)
            .await?;
        self.write_document(UpdateFlags::KEY, &snapshot.flags)
            .await?;
        Ok(())
    }
}
