use std::sync::Arc;

use anyhow::{Context, Result};
use blob_store::BlobStorage;
use data_model::Level;
use metrics::init_provider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use radar_utils::{epoch_ms_to_datetime, get_epoch_time_in_ms};
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    config::PipelineConfig,
    index_store::BlobIndexRepository,
    pipeline::{
        orchestrator::{Orchestrator, RunSummary},
        PipelineContext,
        SourceStores,
    },
    renderer::CommandRenderer,
};

pub struct Service {
    pub config: PipelineConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub orchestrator: Orchestrator,
    meter_provider: Option<SdkMeterProvider>,
}

impl Service {
    pub async fn new(config: PipelineConfig, instance_id: &str) -> Result<Self> {
        // Meters are bound when created, so the provider goes in first.
        let meter_provider = init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval,
            instance_id,
            env!("CARGO_PKG_VERSION"),
        )
        .context("error initializing metrics provider")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing output BlobStorage")?,
        );
        let archive = |level: Level| -> Result<Arc<BlobStorage>> {
            let storage = BlobStorage::new(config.sources.for_level(level).clone())
                .with_context(|| format!("error initializing level {} archive", level))?;
            Ok(Arc::new(storage))
        };
        let sources = SourceStores {
            level2: archive(Level::Level2)?,
            level3: archive(Level::Level3)?,
        };
        let index = Arc::new(BlobIndexRepository::new(storage.clone()));
        let renderer = Arc::new(CommandRenderer::new(&config.renderer));

        info!(
            output = %storage.get_url(),
            products = config.products.len(),
            io_concurrency = config.concurrency.io,
            cpu_concurrency = config.concurrency.cpu,
            "pipeline initialized"
        );
        let ctx = PipelineContext::new(&config, sources, storage, index, renderer);
        let orchestrator = Orchestrator::new(ctx, config.products.clone());

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            orchestrator,
            meter_provider,
        })
    }

    /// One run over every configured product.
    pub async fn run_once(&self) -> RunSummary {
        let now = epoch_ms_to_datetime(get_epoch_time_in_ms());
        self.orchestrator.run(now, &self.shutdown_rx).await
    }

    /// Runs on the configured interval until a shutdown signal arrives. A
    /// signal during a run aborts it between stages.
    pub async fn start(&self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if shutdown_rx.has_changed().unwrap_or(false) {
                info!("shutdown signal received, stopping scheduler");
                return Ok(());
            }

            let summary = self.run_once().await;
            if summary.has_failures() {
                error!(
                    run_id = %summary.run_id,
                    failed = summary.failed().count(),
                    "run finished with failed products"
                );
            }

            info!(interval = ?self.config.schedule_interval, "waiting for next run");
            tokio::select! {
                _ = tokio::time::sleep(self.config.schedule_interval) => {}
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping scheduler");
                    return Ok(());
                }
            }
        }
    }

    /// Flushes pending metrics.
    pub fn shutdown(self) {
        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.shutdown() {
                error!("error shutting down meter provider: {:?}", err);
            }
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, finishing in-flight stage before shutting down");
    let _ = shutdown_tx.send(());
}
