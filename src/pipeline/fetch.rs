use anyhow::anyhow;
use blob_store::BlobStorage;
use data_model::{FetchedRecord, RawFileRecord};
use futures::{stream, StreamExt};
use tracing::{info, warn};

use super::{PipelineContext, StageTally};

/// Downloads `records` from `source` with at most `ctx.io_concurrency`
/// transfers in flight. Records that still fail after the retry policy are
/// dropped. Output order is not the input order.
pub async fn fetch(
    ctx: &PipelineContext,
    source: &BlobStorage,
    records: Vec<RawFileRecord>,
) -> (Vec<FetchedRecord>, StageTally) {
    let attempted = records.len() as u64;
    let fetched: Vec<FetchedRecord> = stream::iter(records)
        .map(|record| async move {
            let key = record.source_key.as_str();
            let result = ctx
                .retry
                .run("fetch", key, ctx.timeouts.fetch, || async move {
                    source
                        .get_bytes(key)
                        .await?
                        .ok_or_else(|| anyhow!("raw file disappeared from the archive"))
                })
                .await;
            match result {
                Ok(payload) => Some(FetchedRecord { record, payload }),
                Err(err) => {
                    warn!(key = %record.source_key, error = %err, "dropping record after failed download");
                    None
                }
            }
        })
        .buffer_unordered(ctx.io_concurrency)
        .filter_map(|fetched| async move { fetched })
        .collect()
        .await;

    let tally = StageTally::new(attempted, fetched.len() as u64);
    info!(%tally, "fetch finished");
    (fetched, tally)
}
