use std::collections::{BTreeSet, HashMap};

use data_model::{ArtifactKey, FileIndex, IndexEntry, Level, MergeOutcome};
use futures::{stream, StreamExt};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use super::{PipelineContext, StageTally};

/// Deletes the artifacts of entries the merge pushed out of the index, then,
/// when enabled, any artifact under the level's prefix that the committed
/// index does not reference.
///
/// Cleanup never fails the run: a blob that cannot be deleted is logged and
/// left for the next orphan sweep.
pub async fn cleanup(
    ctx: &PipelineContext,
    level: Level,
    product: &str,
    merge: &MergeOutcome,
    committed: &FileIndex,
) -> StageTally {
    let mut targets: BTreeSet<String> = merge
        .unreferenced()
        .flat_map(|entry| artifact_blobs(level, product, entry))
        .collect();

    if ctx.sweep_orphans {
        match find_orphans(ctx, level, product, committed).await {
            Ok(orphans) => {
                if !orphans.is_empty() {
                    debug!(count = orphans.len(), "found orphaned artifacts");
                }
                targets.extend(orphans);
            }
            Err(err) => warn!(error = %format!("{:#}", err), "orphan sweep listing failed"),
        }
    }

    let attempted = targets.len() as u64;
    let deleted = stream::iter(targets)
        .map(|key| async move {
            let result = ctx
                .retry
                .run("delete", &key, ctx.timeouts.upload, || {
                    let key = key.as_str();
                    async move { ctx.storage.delete(key).await }
                })
                .await;
            match result {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "unable to delete artifact, leaving it for a later sweep");
                    false
                }
            }
        })
        .buffer_unordered(ctx.io_concurrency)
        .filter(|deleted| futures::future::ready(*deleted))
        .count()
        .await as u64;

    ctx.metrics
        .blobs_deleted
        .add(deleted, &[KeyValue::new("product", product.to_string())]);
    let tally = StageTally::new(attempted, deleted);
    info!(%tally, "cleanup finished");
    tally
}

fn artifact_blobs(level: Level, product: &str, entry: &IndexEntry) -> Vec<String> {
    entry
        .sweeps
        .iter()
        .flat_map(|&sweep| {
            let key = ArtifactKey::new(level, &entry.key, product, sweep);
            [key.image_key(), key.metadata_key()]
        })
        .collect()
}

/// Artifact blobs of `product` whose file or sweep is not in `committed`.
/// Blobs that do not parse as this product's artifacts are never returned.
async fn find_orphans(
    ctx: &PipelineContext,
    level: Level,
    product: &str,
    committed: &FileIndex,
) -> anyhow::Result<Vec<String>> {
    let referenced: HashMap<&str, &[u32]> = committed
        .entries
        .iter()
        .map(|e| (e.key.as_str(), e.sweeps.as_slice()))
        .collect();
    let listed = ctx.storage.list(&level.artifact_prefix()).await?;
    Ok(listed
        .into_iter()
        .filter(|blob_key| match ArtifactKey::parse(level, product, blob_key) {
            Some(key) => !referenced
                .get(key.normalized_key.as_str())
                .is_some_and(|sweeps| sweeps.contains(&key.sweep)),
            None => false,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use data_model::test_objects::tests::index_entry;

    use super::*;
    use crate::testing::TestContext;

    async fn put_artifacts(test_ctx: &TestContext, level: Level, product: &str, entry: &IndexEntry) {
        for key in artifact_blobs(level, product, entry) {
            test_ctx
                .storage
                .put_bytes(&key, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_evicted_and_rejected_artifacts_are_deleted() {
        let test_ctx = TestContext::new().await;
        let kept = index_entry("KPDT20250409_120000_HHC", 0, Some("HHC"));
        let evicted = index_entry("KPDT20250409_110000_HHC", -60, Some("HHC"));
        let rejected = index_entry("KPDT20250409_100000_HHC", -120, Some("HHC"));
        for entry in [&kept, &evicted, &rejected] {
            put_artifacts(&test_ctx, Level::Level3, "hydrometeor", entry).await;
        }
        let merge = MergeOutcome {
            evicted: vec![evicted],
            rejected: vec![rejected],
            ..Default::default()
        };
        let committed = FileIndex {
            entries: vec![kept],
        };

        let tally = cleanup(&test_ctx.ctx, Level::Level3, "hydrometeor", &merge, &committed).await;
        assert_eq!(StageTally::new(4, 4), tally);
        assert_eq!(
            vec![
                "plots_level3/KPDT20250409_120000_HHC_hydrometeor_idx0.json",
                "plots_level3/KPDT20250409_120000_HHC_hydrometeor_idx0.png",
            ],
            test_ctx.storage.list("plots_level3/").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_orphan_sweep_spares_other_products() {
        let test_ctx = TestContext::new().await;
        let indexed = index_entry("KPDT20250409_120000_DAA", 0, Some("DAA"));
        let orphan = index_entry("KPDT20250409_110000_DAA", -60, Some("DAA"));
        put_artifacts(&test_ctx, Level::Level3, "precipitation", &indexed).await;
        put_artifacts(&test_ctx, Level::Level3, "precipitation", &orphan).await;
        // Same file rendered for another product, plus a stray blob.
        put_artifacts(&test_ctx, Level::Level3, "hydrometeor", &orphan).await;
        test_ctx
            .storage
            .put_bytes("plots_level3/notes.txt", Bytes::from_static(b"keep"))
            .await
            .unwrap();

        let committed = FileIndex {
            entries: vec![indexed],
        };
        let tally = cleanup(
            &test_ctx.ctx,
            Level::Level3,
            "precipitation",
            &MergeOutcome::default(),
            &committed,
        )
        .await;

        assert_eq!(StageTally::new(2, 2), tally);
        assert_eq!(
            vec![
                "plots_level3/KPDT20250409_110000_DAA_hydrometeor_idx0.json",
                "plots_level3/KPDT20250409_110000_DAA_hydrometeor_idx0.png",
                "plots_level3/KPDT20250409_120000_DAA_precipitation_idx0.json",
                "plots_level3/KPDT20250409_120000_DAA_precipitation_idx0.png",
                "plots_level3/notes.txt",
            ],
            test_ctx.storage.list("plots_level3/").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_orphan_sweep_can_be_disabled() {
        let mut test_ctx = TestContext::new().await;
        test_ctx.ctx.sweep_orphans = false;
        let orphan = index_entry("KPDT20250409_110000_V06", -60, None);
        put_artifacts(&test_ctx, Level::Level2, "reflectivity", &orphan).await;

        let tally = cleanup(
            &test_ctx.ctx,
            Level::Level2,
            "reflectivity",
            &MergeOutcome::default(),
            &FileIndex::default(),
        )
        .await;
        assert_eq!(StageTally::default(), tally);
        assert_eq!(2, test_ctx.storage.list("plots_level2/").await.unwrap().len());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_stop_cleanup() {
        let test_ctx = TestContext::new().await;
        let kept = index_entry("KPDT20250409_120000_HHC", 0, Some("HHC"));
        let stuck = index_entry("KPDT20250409_110000_HHC", -60, Some("HHC"));
        let evicted = index_entry("KPDT20250409_100000_HHC", -120, Some("HHC"));
        let orphan = index_entry("KPDT20250409_090000_HHC", -180, Some("HHC"));
        for entry in [&kept, &evicted, &orphan] {
            put_artifacts(&test_ctx, Level::Level3, "hydrometeor", entry).await;
        }
        put_artifacts(&test_ctx, Level::Level3, "hydrometeor", &stuck).await;
        // A directory in place of the image cannot be removed as a file.
        let stuck_image = ArtifactKey::new(Level::Level3, &stuck.key, "hydrometeor", 0).image_key();
        let stuck_path = test_ctx.storage_dir.join(&stuck_image);
        std::fs::remove_file(&stuck_path).unwrap();
        std::fs::create_dir_all(&stuck_path).unwrap();

        let merge = MergeOutcome {
            evicted: vec![stuck, evicted],
            ..Default::default()
        };
        let committed = FileIndex {
            entries: vec![kept],
        };
        let tally = cleanup(&test_ctx.ctx, Level::Level3, "hydrometeor", &merge, &committed).await;

        assert_eq!(StageTally::new(6, 5), tally);
        assert!(stuck_path.is_dir());
        assert_eq!(
            vec![
                "plots_level3/KPDT20250409_120000_HHC_hydrometeor_idx0.json",
                "plots_level3/KPDT20250409_120000_HHC_hydrometeor_idx0.png",
            ],
            test_ctx.storage.list("plots_level3/").await.unwrap()
        );
    }
}
