use std::collections::HashMap;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_model::{FileIndex, IndexEntry, Level, MergeOutcome, ProcessedArtifact};
use futures::{stream, StreamExt};
use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::{process::RenderedRecord, PipelineContext, StageTally};
use crate::{error::PipelineError, index_store::IndexSnapshot};

/// What the publish stage did for one product.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub merge: MergeOutcome,
    /// The snapshot as committed, or as loaded when nothing changed.
    pub snapshot: IndexSnapshot,
    pub committed: bool,
    pub artifacts_published: u64,
    pub tally: StageTally,
}

/// Uploads the artifacts of `rendered`, then merges the records that have at
/// least one published artifact into the index and commits it.
///
/// Upload failures shrink the batch. A failed index load or commit is
/// [`PipelineError::Consistency`]; artifacts uploaded by then stay behind
/// without an index entry.
pub async fn publish(
    ctx: &PipelineContext,
    level: Level,
    product: &str,
    rendered: Vec<RenderedRecord>,
    now: DateTime<Utc>,
) -> Result<PublishOutcome, PipelineError> {
    let attempted = rendered.len() as u64;
    let uploads: Vec<(usize, &ProcessedArtifact)> = rendered
        .iter()
        .enumerate()
        .flat_map(|(idx, r)| r.artifacts.iter().map(move |a| (idx, a)))
        .collect();

    let published: Vec<(usize, u32)> = stream::iter(uploads)
        .map(|(idx, artifact)| async move {
            match upload_artifact(ctx, artifact).await {
                Ok(()) => Some((idx, artifact.key.sweep)),
                Err(err) => {
                    warn!(error = %err, "artifact upload failed, leaving it out of the index");
                    None
                }
            }
        })
        .buffer_unordered(ctx.io_concurrency)
        .filter_map(|published| async move { published })
        .collect()
        .await;
    let artifacts_published = published.len() as u64;

    let mut sweeps_by_record: HashMap<usize, Vec<u32>> = HashMap::new();
    for (idx, sweep) in published {
        sweeps_by_record.entry(idx).or_default().push(sweep);
    }
    let batch: Vec<IndexEntry> = rendered
        .iter()
        .enumerate()
        .filter_map(|(idx, r)| {
            sweeps_by_record
                .remove(&idx)
                .map(|sweeps| IndexEntry::new(&r.record, sweeps))
        })
        .collect();
    let tally = StageTally::new(attempted, batch.len() as u64);

    let mut snapshot =
        ctx.index
            .load(level, product)
            .await
            .map_err(|source| PipelineError::Consistency {
                document: FileIndex::key(level, product),
                source: source.context("reloading index before merge"),
            })?;
    let merge = snapshot.files.merge(batch, &ctx.retention, now);
    snapshot.registry.apply(product, &merge);
    let drifted = snapshot.registry.reconcile(product, &snapshot.files);
    if !merge.added.is_empty() {
        snapshot
            .flags
            .set(product, u64::try_from(now.timestamp_millis()).unwrap_or_default());
    }

    let committed = merge.changed() || drifted;
    if committed {
        ctx.index.commit(&snapshot).await?;
    }

    let labels = [KeyValue::new("product", product.to_string())];
    ctx.metrics
        .artifacts_published
        .add(artifacts_published, &labels);
    info!(
        %tally,
        artifacts_published,
        added = merge.added.len(),
        duplicates = merge.duplicates,
        evicted = merge.evicted.len(),
        rejected = merge.rejected.len(),
        indexed = snapshot.files.len(),
        committed,
        "publish finished"
    );

    Ok(PublishOutcome {
        merge,
        snapshot,
        committed,
        artifacts_published,
        tally,
    })
}

async fn upload_artifact(
    ctx: &PipelineContext,
    artifact: &ProcessedArtifact,
) -> Result<(), PipelineError> {
    let metadata = serde_json::to_vec(&artifact.metadata())
        .context("serializing artifact metadata")
        .map_err(|source| PipelineError::TransientIo {
            operation: "upload",
            key: artifact.key.metadata_key(),
            source,
        })?;
    let documents = [
        (artifact.key.image_key(), artifact.image.clone()),
        (artifact.key.metadata_key(), Bytes::from(metadata)),
    ];
    for (key, data) in documents {
        let key = key.as_str();
        ctx.retry
            .run("upload", key, ctx.timeouts.upload, || {
                let data = data.clone();
                async move { ctx.storage.put_bytes(key, data).await }
            })
            .await?;
    }
    Ok(())
}
