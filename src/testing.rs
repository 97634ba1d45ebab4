use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blob_store::{BlobStorage, BlobStorageConfig};
use bytes::Bytes;
use data_model::{
    BoundingBox,
    FetchedRecord,
    FileIndex,
    Level,
    ProductDescriptor,
    RawFileRecord,
};
use tokio::sync::watch;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{PipelineConfig, RetryConfig},
    error::PipelineError,
    index_store::{BlobIndexRepository, IndexRepository, IndexSnapshot},
    pipeline::{orchestrator::Orchestrator, PipelineContext, SourceStores},
    renderer::{RenderError, RenderedSweep, Renderer},
};

/// Payload the archive and the scripted renderer agree on: the normalized key.
pub fn fetched(record: RawFileRecord) -> FetchedRecord {
    FetchedRecord {
        payload: Bytes::from(record.normalized_key.clone()),
        record,
    }
}

/// In-process renderer driven by the payload produced by [`fetched`]. Clones
/// share the in-flight counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRenderer {
    sweeps: u32,
    fail_sweeps: HashSet<u32>,
    fail_keys: HashSet<String>,
    fail_count: bool,
    delay: Option<Duration>,
    shutdown_on_render: Option<Arc<watch::Sender<()>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedRenderer {
    pub fn new(sweeps: u32) -> Self {
        Self {
            sweeps,
            ..Default::default()
        }
    }

    pub fn fail_sweep(mut self, sweep: u32) -> Self {
        self.fail_sweeps.insert(sweep);
        self
    }

    pub fn fail_key(mut self, normalized_key: &str) -> Self {
        self.fail_keys.insert(normalized_key.to_string());
        self
    }

    pub fn fail_count(mut self) -> Self {
        self.fail_count = true;
        self
    }

    /// Every render sleeps this long before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Signals `shutdown_tx` from every render.
    pub fn shutdown_on_render(mut self, shutdown_tx: watch::Sender<()>) -> Self {
        self.shutdown_on_render = Some(Arc::new(shutdown_tx));
        self
    }

    /// Renders currently running, including ones that were dropped mid-way.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn sweep_count(
        &self,
        _raw: &[u8],
        _descriptor: &ProductDescriptor,
    ) -> Result<u32, RenderError> {
        if self.fail_count {
            return Err(RenderError::InvalidOutput("no sweeps".to_string()));
        }
        Ok(self.sweeps)
    }

    async fn render(
        &self,
        raw: &[u8],
        descriptor: &ProductDescriptor,
        sweep: Option<u32>,
    ) -> Result<RenderedSweep, RenderError> {
        let _running = self.enter();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(shutdown_tx) = &self.shutdown_on_render {
            let _ = shutdown_tx.send(());
        }
        let key = String::from_utf8_lossy(raw).into_owned();
        if self.fail_keys.contains(&key) {
            return Err(RenderError::Failed(format!("scripted failure for {}", key)));
        }
        if let Some(sweep) = sweep.filter(|s| self.fail_sweeps.contains(s)) {
            return Err(RenderError::Failed(format!("scripted failure for sweep {}", sweep)));
        }
        Ok(RenderedSweep {
            image: Bytes::from(format!("{}:{}:{:?}", key, descriptor.product, sweep)),
            bbox: BoundingBox {
                min_lon: -121.5,
                min_lat: 43.4,
                max_lon: -116.1,
                max_lat: 47.9,
            },
            elevation_angle_degrees: sweep.map(|s| 0.5 + s as f64),
            azimuth_angle_degrees: None,
        })
    }
}

/// Blob backed index repository whose loads and commits can be made to fail.
pub struct FlakyIndexRepository {
    inner: BlobIndexRepository,
    fail_loads: AtomicBool,
    fail_commits: AtomicBool,
}

impl FlakyIndexRepository {
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexRepository for FlakyIndexRepository {
    async fn load(&self, level: Level, product: &str) -> Result<IndexSnapshot> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(anyhow!("injected load failure"));
        }
        self.inner.load(level, product).await
    }

    async fn commit(&self, snapshot: &IndexSnapshot) -> Result<(), PipelineError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(PipelineError::Consistency {
                document: FileIndex::key(snapshot.level, &snapshot.product),
                source: anyhow!("injected commit failure"),
            });
        }
        self.inner.commit(snapshot).await
    }
}

pub struct TestContext {
    pub ctx: PipelineContext,
    pub config: PipelineConfig,
    /// Raw file archive; serves both levels.
    pub archive: Arc<BlobStorage>,
    /// Output store for artifacts and index documents.
    pub storage: Arc<BlobStorage>,
    pub storage_dir: PathBuf,
    pub index: Arc<FlakyIndexRepository>,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_renderer(ScriptedRenderer::new(1)).await
    }

    pub async fn with_renderer(renderer: ScriptedRenderer) -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir().unwrap();
        let storage_dir = temp_dir.path().join("output");
        let archive_dir = temp_dir.path().join("archive");

        let mut config = PipelineConfig {
            blob_storage: BlobStorageConfig::new(storage_dir.to_str().unwrap()),
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            ..Default::default()
        };
        config.sources.level2 = BlobStorageConfig::new(archive_dir.to_str().unwrap());
        config.sources.level3 = config.sources.level2.clone();
        config.concurrency.io = 4;
        config.concurrency.cpu = 2;

        let archive = Arc::new(BlobStorage::new(config.sources.level2.clone()).unwrap());
        let storage = Arc::new(BlobStorage::new(config.blob_storage.clone()).unwrap());
        let index = Arc::new(FlakyIndexRepository {
            inner: BlobIndexRepository::new(storage.clone()),
            fail_loads: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
        });
        let ctx = PipelineContext::new(
            &config,
            SourceStores {
                level2: archive.clone(),
                level3: archive.clone(),
            },
            storage.clone(),
            index.clone(),
            Arc::new(renderer),
        );

        Self {
            ctx,
            config,
            archive,
            storage,
            storage_dir,
            index,
            _temp_dir: temp_dir,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.ctx.clone(), self.config.products.clone())
    }

    /// Places a raw file in the archive with the payload [`fetched`] uses.
    pub async fn seed_archive(&self, record: &RawFileRecord) {
        self.archive
            .put_bytes(&record.source_key, Bytes::from(record.normalized_key.clone()))
            .await
            .unwrap();
    }

    pub async fn load(&self, level: Level, product: &str) -> IndexSnapshot {
        self.index.load(level, product).await.unwrap()
    }
}
