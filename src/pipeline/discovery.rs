use std::collections::HashSet;

use blob_store::BlobStorage;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use data_model::{Level, RawFileRecord};
use tracing::{debug, info};

use crate::{config::ProductJob, error::PipelineError};

/// Lists the raw files of `job` scanned within `[now - window, now]`, oldest
/// first and without duplicate keys.
///
/// Any failed listing makes the whole discovery fail: a partial listing would
/// look like missing data to the rest of the run.
pub async fn discover(
    source: &BlobStorage,
    job: &ProductJob,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<RawFileRecord>, PipelineError> {
    let start = now - window;
    let mut records = Vec::new();
    for prefix in listing_prefixes(job, start, now) {
        let keys = source
            .list(&prefix)
            .await
            .map_err(|source| PipelineError::SourceUnavailable {
                prefix: prefix.clone(),
                source,
            })?;
        debug!(%prefix, keys = keys.len(), "listed source prefix");
        for key in keys {
            let record = match job.level {
                Level::Level2 => RawFileRecord::from_level2_key(&key, &job.product),
                Level::Level3 => RawFileRecord::from_level3_key(&key, &job.product),
            };
            let Some(record) = record else {
                debug!(%key, "skipping unrecognized source key");
                continue;
            };
            if !matches_job(&record, job) || record.timestamp < start || record.timestamp > now {
                continue;
            }
            records.push(record);
        }
    }

    records.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.normalized_key.cmp(&b.normalized_key))
    });
    let mut seen = HashSet::new();
    records.retain(|r| seen.insert(r.normalized_key.clone()));

    info!(
        product = %job.product,
        level = job.level.as_ref(),
        found = records.len(),
        %start,
        end = %now,
        "discovered raw files"
    );
    Ok(records)
}

fn matches_job(record: &RawFileRecord, job: &ProductJob) -> bool {
    if !record.site.eq_ignore_ascii_case(&job.site) {
        return false;
    }
    match &record.code {
        Some(code) => job.codes.iter().any(|c| c.eq_ignore_ascii_case(code)),
        None => job.codes.is_empty(),
    }
}

/// One prefix per UTC day for Level 2, one per (code, UTC day) for Level 3.
fn listing_prefixes(job: &ProductJob, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
    let days = utc_days(start, end);
    match job.level {
        Level::Level2 => days
            .iter()
            .map(|day| format!("{}/{}/", day.format("%Y/%m/%d"), job.site.to_uppercase()))
            .collect(),
        Level::Level3 => job
            .codes
            .iter()
            .flat_map(|code| {
                days.iter().map(move |day| {
                    format!(
                        "{}/{}/{}/",
                        job.site.to_uppercase(),
                        code.to_uppercase(),
                        day.format("%Y/%m/%d")
                    )
                })
            })
            .collect(),
    }
}

fn utc_days(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    start
        .date_naive()
        .iter_days()
        .take_while(|day| *day <= end.date_naive())
        .collect()
}
