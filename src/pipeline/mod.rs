pub mod cleanup;
pub mod dedup;
pub mod discovery;
pub mod fetch;
pub mod orchestrator;
pub mod process;
pub mod publish;
pub mod retry_policy;

use std::{fmt, sync::Arc};

use blob_store::BlobStorage;
use data_model::{Level, RetentionPolicy};
use metrics::pipeline::Metrics;

use crate::{
    config::{PipelineConfig, TimeoutConfig},
    index_store::IndexRepository,
    renderer::Renderer,
};
use retry_policy::RetryPolicy;

/// Attempted, succeeded and skipped counts of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTally {
    pub attempted: u64,
    pub succeeded: u64,
    pub skipped: u64,
}

impl StageTally {
    pub fn new(attempted: u64, succeeded: u64) -> Self {
        Self {
            attempted,
            succeeded,
            skipped: attempted.saturating_sub(succeeded),
        }
    }

    pub fn as_tuple(&self) -> (u64, u64, u64) {
        (self.attempted, self.succeeded, self.skipped)
    }
}

impl fmt::Display for StageTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ok, {} skipped",
            self.succeeded, self.attempted, self.skipped
        )
    }
}

/// Archives the raw files are listed and downloaded from.
#[derive(Clone)]
pub struct SourceStores {
    pub level2: Arc<BlobStorage>,
    pub level3: Arc<BlobStorage>,
}

impl SourceStores {
    pub fn for_level(&self, level: Level) -> &Arc<BlobStorage> {
        match level {
            Level::Level2 => &self.level2,
            Level::Level3 => &self.level3,
        }
    }
}

/// Collaborators and limits shared by every stage of a run.
#[derive(Clone)]
pub struct PipelineContext {
    pub sources: SourceStores,
    pub storage: Arc<BlobStorage>,
    pub index: Arc<dyn IndexRepository>,
    pub renderer: Arc<dyn Renderer>,
    pub retry: RetryPolicy,
    pub io_concurrency: usize,
    pub cpu_concurrency: usize,
    pub timeouts: TimeoutConfig,
    pub retention: RetentionPolicy,
    pub sweep_orphans: bool,
    pub window: chrono::Duration,
    pub metrics: Metrics,
}

impl PipelineContext {
    pub fn new(
        config: &PipelineConfig,
        sources: SourceStores,
        storage: Arc<BlobStorage>,
        index: Arc<dyn IndexRepository>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            sources,
            storage,
            index,
            renderer,
            retry: config.retry.policy(),
            io_concurrency: config.concurrency.io,
            cpu_concurrency: config.concurrency.cpu,
            timeouts: config.timeouts.clone(),
            retention: config.retention.policy(),
            sweep_orphans: config.cleanup.sweep_orphans,
            window: config.window(),
            metrics: Metrics::new(),
        }
    }
}
