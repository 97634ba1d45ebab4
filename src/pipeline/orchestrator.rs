use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use data_model::{FetchedRecord, FileIndex, Level, RawFileRecord};
use metrics::{AutoIncrement, Timer};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use super::{
    cleanup::cleanup,
    dedup::filter_new,
    discovery::discover,
    fetch::fetch,
    process::{process, RenderedRecord},
    publish::{publish, PublishOutcome},
    PipelineContext,
    StageTally,
};
use crate::{config::ProductJob, error::PipelineError};

/// Position of one product run in its stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Discover,
    Dedup,
    Fetch,
    Process,
    Publish,
    Cleanup,
    Done,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Aborted)
    }
}

/// Counts and outcome of one product run.
#[derive(Debug, Clone)]
pub struct ProductRunReport {
    pub level: Level,
    pub product: String,
    pub state: RunState,
    pub discovered: u64,
    pub new: u64,
    pub fetch: StageTally,
    pub process: StageTally,
    pub publish: StageTally,
    pub artifacts_published: u64,
    pub evicted: u64,
    pub cleanup: StageTally,
    pub indexed: u64,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl ProductRunReport {
    fn new(job: &ProductJob) -> Self {
        Self {
            level: job.level,
            product: job.product.clone(),
            state: RunState::Discover,
            discovered: 0,
            new: 0,
            fetch: StageTally::default(),
            process: StageTally::default(),
            publish: StageTally::default(),
            artifacts_published: 0,
            evicted: 0,
            cleanup: StageTally::default(),
            indexed: 0,
            elapsed: Duration::ZERO,
            error: None,
        }
    }
}

impl fmt::Display for ProductRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "level{} {}: {} in {:.1?} | discovered {}, new {}, fetched {}, processed {}, published {} ({} artifacts), evicted {}, deleted {}, indexed {}",
            self.level,
            self.product,
            self.state,
            self.elapsed,
            self.discovered,
            self.new,
            self.fetch,
            self.process,
            self.publish,
            self.artifacts_published,
            self.evicted,
            self.cleanup,
            self.indexed,
        )?;
        if let Some(error) = &self.error {
            write!(f, " | error: {}", error)?;
        }
        Ok(())
    }
}

/// Reports of every product in one run, in job order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub reports: Vec<ProductRunReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &ProductRunReport> {
        self.reports.iter().filter(|r| r.state == RunState::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    pub fn was_aborted(&self) -> bool {
        self.reports.iter().any(|r| r.state == RunState::Aborted)
    }
}

/// Runs every configured product job through the stage sequence, one product
/// after another. Products share the registry and flag documents, so their
/// commits must not interleave.
pub struct Orchestrator {
    ctx: PipelineContext,
    jobs: Vec<ProductJob>,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext, jobs: Vec<ProductJob>) -> Self {
        Self { ctx, jobs }
    }

    /// One pass over every job. Products after a shutdown signal are reported
    /// as aborted without running.
    pub async fn run(&self, now: DateTime<Utc>, shutdown_rx: &watch::Receiver<()>) -> RunSummary {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = std::time::Instant::now();
        let mut reports = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let span = info_span!(
                "product_run",
                run_id = %run_id,
                level = %job.level,
                product = %job.product
            );
            let report = self.run_product(job, now, shutdown_rx).instrument(span).await;
            reports.push(report);
        }

        let summary = RunSummary {
            run_id,
            reports,
            elapsed: started.elapsed(),
        };
        for report in &summary.reports {
            match report.state {
                RunState::Done => info!(run_id = %summary.run_id, "{}", report),
                RunState::Aborted => warn!(run_id = %summary.run_id, "{}", report),
                _ => error!(run_id = %summary.run_id, "{}", report),
            }
        }
        info!(
            run_id = %summary.run_id,
            products = summary.reports.len(),
            failed = summary.failed().count(),
            aborted = summary.was_aborted(),
            elapsed = ?summary.elapsed,
            "run finished"
        );
        summary
    }

    async fn run_product(
        &self,
        job: &ProductJob,
        now: DateTime<Utc>,
        shutdown_rx: &watch::Receiver<()>,
    ) -> ProductRunReport {
        let ctx = &self.ctx;
        let source = ctx.sources.for_level(job.level);
        let product_label = [KeyValue::new("product", job.product.clone())];
        let run_timer = Timer::start_with_labels(&ctx.metrics.run_duration, &product_label);

        let mut report = ProductRunReport::new(job);
        let mut discovered: Vec<RawFileRecord> = Vec::new();
        let mut new_records: Vec<RawFileRecord> = Vec::new();
        let mut fetched: Vec<FetchedRecord> = Vec::new();
        let mut rendered: Vec<RenderedRecord> = Vec::new();
        let mut published: Option<PublishOutcome> = None;

        let mut state = RunState::Discover;
        loop {
            if !state.is_terminal() && shutdown_rx.has_changed().unwrap_or(false) {
                info!(stage = %state, "shutdown requested, aborting before stage");
                state = RunState::Aborted;
            }
            report.state = state;
            if state.is_terminal() {
                break;
            }

            let stage_labels = [
                KeyValue::new("stage", state.as_ref().to_string()),
                KeyValue::new("product", job.product.clone()),
            ];
            let _stage_timer = Timer::start_with_labels(&ctx.metrics.stage_duration, &stage_labels);
            state = match state {
                RunState::Discover => match discover(source, job, now, ctx.window).await {
                    Ok(records) => {
                        report.discovered = records.len() as u64;
                        discovered = records;
                        RunState::Dedup
                    }
                    Err(err) => fail(&mut report, err),
                },
                RunState::Dedup => match ctx.index.load(job.level, &job.product).await {
                    Ok(snapshot) => {
                        new_records = filter_new(std::mem::take(&mut discovered), &snapshot.files);
                        report.new = new_records.len() as u64;
                        info!(
                            discovered = report.discovered,
                            new = report.new,
                            indexed = snapshot.files.len(),
                            "dedup finished"
                        );
                        if new_records.is_empty() {
                            // Retention and the orphan sweep still run on an
                            // unchanged batch.
                            RunState::Publish
                        } else {
                            RunState::Fetch
                        }
                    }
                    Err(err) => fail(
                        &mut report,
                        PipelineError::Consistency {
                            document: FileIndex::key(job.level, &job.product),
                            source: err.context("loading index for dedup"),
                        },
                    ),
                },
                RunState::Fetch => {
                    let (records, tally) =
                        fetch(ctx, source, std::mem::take(&mut new_records)).await;
                    ctx.metrics.record_stage("fetch", &job.product, tally.as_tuple());
                    report.fetch = tally;
                    fetched = records;
                    RunState::Process
                }
                RunState::Process => {
                    let (records, tally) =
                        process(ctx, std::mem::take(&mut fetched), job.field.as_deref()).await;
                    ctx.metrics.record_stage("process", &job.product, tally.as_tuple());
                    report.process = tally;
                    rendered = records;
                    RunState::Publish
                }
                RunState::Publish => {
                    match publish(ctx, job.level, &job.product, std::mem::take(&mut rendered), now)
                        .await
                    {
                        Ok(outcome) => {
                            ctx.metrics
                                .record_stage("publish", &job.product, outcome.tally.as_tuple());
                            report.publish = outcome.tally;
                            report.artifacts_published = outcome.artifacts_published;
                            report.evicted = outcome.merge.unreferenced().count() as u64;
                            report.indexed = outcome.snapshot.files.len() as u64;
                            published = Some(outcome);
                            RunState::Cleanup
                        }
                        Err(err) => fail(&mut report, err),
                    }
                }
                RunState::Cleanup => {
                    if let Some(outcome) = &published {
                        let tally = cleanup(
                            ctx,
                            job.level,
                            &job.product,
                            &outcome.merge,
                            &outcome.snapshot.files,
                        )
                        .await;
                        ctx.metrics.record_stage("cleanup", &job.product, tally.as_tuple());
                        report.cleanup = tally;
                    }
                    RunState::Done
                }
                RunState::Done | RunState::Failed | RunState::Aborted => state,
            };
        }

        if report.state == RunState::Failed {
            ctx.metrics.failed_runs.increment(&product_label);
        }
        report.elapsed = run_timer.elapsed();
        report
    }
}

fn fail(report: &mut ProductRunReport, err: PipelineError) -> RunState {
    error!(error = %err, fatal = err.is_fatal(), "product run failed");
    report.error = Some(err.to_string());
    RunState::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_names() {
        assert_eq!("discover", RunState::Discover.as_ref());
        assert_eq!("aborted", RunState::Aborted.to_string());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Cleanup.is_terminal());
    }

    #[test]
    fn test_summary_flags_failures() {
        let job = ProductJob {
            level: Level::Level2,
            product: "reflectivity".to_string(),
            site: "KPDT".to_string(),
            codes: vec![],
            field: None,
        };
        let mut failed = ProductRunReport::new(&job);
        failed.state = RunState::Failed;
        failed.error = Some("boom".to_string());
        let mut done = ProductRunReport::new(&job);
        done.state = RunState::Done;

        let summary = RunSummary {
            reports: vec![done, failed],
            ..Default::default()
        };
        assert!(summary.has_failures());
        assert!(!summary.was_aborted());
        assert!(summary.reports[1].to_string().contains("error: boom"));
    }
}
