use std::{collections::HashSet, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::BlobStorageConfig;
use data_model::{Level, RetentionPolicy};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

use crate::pipeline::retry_policy::RetryPolicy;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "RADAR_";
/// Upper bound for the discovery window and the retention age: one year.
pub const MAX_LOOKBACK_MINUTES: u64 = 366 * 24 * 60;

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    /// Where artifacts and index documents are published.
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub sources: SourceArchives,
    #[serde(default = "default_products")]
    pub products: Vec<ProductJob>,
    /// Discovery looks back this far from now.
    #[serde_inline_default(180)]
    pub window_minutes: u64,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    /// Time between runs in `serve` mode.
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(300))]
    pub schedule_interval: Duration,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            env: LOCAL_ENV.to_string(),
            blob_storage: Default::default(),
            sources: Default::default(),
            products: default_products(),
            window_minutes: 180,
            concurrency: Default::default(),
            retry: Default::default(),
            timeouts: Default::default(),
            retention: Default::default(),
            cleanup: Default::default(),
            renderer: Default::default(),
            schedule_interval: Duration::from_secs(300),
            telemetry: Default::default(),
        }
    }
}

/// Public archives the raw files are discovered in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceArchives {
    #[serde(default = "default_level2_archive")]
    pub level2: BlobStorageConfig,
    #[serde(default = "default_level3_archive")]
    pub level3: BlobStorageConfig,
}

impl Default for SourceArchives {
    fn default() -> Self {
        Self {
            level2: default_level2_archive(),
            level3: default_level3_archive(),
        }
    }
}

impl SourceArchives {
    pub fn for_level(&self, level: Level) -> &BlobStorageConfig {
        match level {
            Level::Level2 => &self.level2,
            Level::Level3 => &self.level3,
        }
    }
}

fn default_level2_archive() -> BlobStorageConfig {
    BlobStorageConfig::public_s3("noaa-nexrad-level2", "us-east-1")
}

fn default_level3_archive() -> BlobStorageConfig {
    BlobStorageConfig::public_s3("unidata-nexrad-level3", "us-east-1")
}

/// One product to keep published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductJob {
    pub level: Level,
    pub product: String,
    /// Radar site as it appears in archive keys: `KPDT` for Level 2, `PDT`
    /// for Level 3.
    pub site: String,
    /// Level 3 product codes to discover, e.g. `HHC`.
    #[serde(default)]
    pub codes: Vec<String>,
    /// Renderer field name for the product.
    #[serde(default)]
    pub field: Option<String>,
}

fn default_products() -> Vec<ProductJob> {
    vec![
        ProductJob {
            level: Level::Level2,
            product: "reflectivity".to_string(),
            site: "KPDT".to_string(),
            codes: vec![],
            field: Some("reflectivity".to_string()),
        },
        ProductJob {
            level: Level::Level3,
            product: "hydrometeor".to_string(),
            site: "PDT".to_string(),
            codes: vec!["HHC".to_string()],
            field: Some("radar_echo_classification".to_string()),
        },
        ProductJob {
            level: Level::Level3,
            product: "precipitation".to_string(),
            site: "PDT".to_string(),
            codes: vec!["DAA".to_string(), "DTA".to_string()],
            field: Some("radar_estimated_rain_rate".to_string()),
        },
    ]
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Concurrent transfers for fetch, upload and delete.
    #[serde_inline_default(10)]
    pub io: usize,
    /// Concurrent renders. Defaults to the number of CPUs.
    #[serde(default = "default_cpu_concurrency")]
    pub cpu: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            io: 10,
            cpu: default_cpu_concurrency(),
        }
    }
}

fn default_cpu_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde_inline_default(3)]
    pub max_attempts: u32,
    #[serde_inline_default(500)]
    pub initial_backoff_ms: u64,
    #[serde_inline_default(10_000)]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(120))]
    pub fetch: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(60))]
    pub upload: Duration,
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(300))]
    pub render: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(120),
            upload: Duration::from_secs(60),
            render: Duration::from_secs(300),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde_inline_default(100)]
    pub max_entries: usize,
    /// Entries older than this, measured from the newest added entry, are
    /// evicted. `null` disables age based retention.
    #[serde_inline_default(Some(180))]
    pub max_age_minutes: Option<u64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_age_minutes: Some(180),
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_entries: self.max_entries,
            max_age: self.max_age_minutes.map(lookback),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Delete artifact blobs of this product that no index entry references.
    #[serde_inline_default(true)]
    pub sweep_orphans: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_orphans: true,
        }
    }
}

/// External command implementing the rendering protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default = "default_renderer_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: default_renderer_command(),
            args: vec![],
        }
    }
}

fn default_renderer_command() -> String {
    "radar-render".to_string()
}

impl PipelineConfig {
    /// Loads a YAML file, then applies `RADAR_` environment overrides such as
    /// `RADAR_RETENTION__MAX_ENTRIES=50`.
    pub fn from_path(path: &Path) -> Result<PipelineConfig> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("unable to read config file {}: {}", path.display(), e))?;
        Self::from_figment(Figment::new().merge(Yaml::string(&config_str)))
    }

    /// Defaults plus `RADAR_` environment overrides.
    pub fn from_env() -> Result<PipelineConfig> {
        Self::from_figment(Figment::from(figment::providers::Serialized::defaults(
            PipelineConfig::default(),
        )))
    }

    #[cfg(test)]
    fn from_yaml_str(config_str: &str) -> Result<PipelineConfig> {
        let config: PipelineConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn from_figment(figment: Figment) -> Result<PipelineConfig> {
        let config: PipelineConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.products.is_empty() {
            return Err(anyhow!("at least one product must be configured"));
        }
        let mut seen = HashSet::new();
        for job in &self.products {
            if job.product.is_empty() || job.product.contains('/') {
                return Err(anyhow!("invalid product name: {:?}", job.product));
            }
            if !seen.insert((job.level, job.product.as_str())) {
                return Err(anyhow!(
                    "duplicate product: level {} {}",
                    job.level,
                    job.product
                ));
            }
            match job.level {
                Level::Level2 if job.site.len() != 4 => {
                    return Err(anyhow!(
                        "level 2 site must be 4 characters, got {:?} for {}",
                        job.site,
                        job.product
                    ));
                }
                Level::Level3 if job.codes.is_empty() => {
                    return Err(anyhow!(
                        "level 3 product {} needs at least one product code",
                        job.product
                    ));
                }
                Level::Level3 if job.site.len() != 3 => {
                    return Err(anyhow!(
                        "level 3 site must be 3 characters, got {:?} for {}",
                        job.site,
                        job.product
                    ));
                }
                _ => {}
            }
        }
        if self.window_minutes == 0 || self.window_minutes > MAX_LOOKBACK_MINUTES {
            return Err(anyhow!(
                "window_minutes must be between 1 and {}, got {}",
                MAX_LOOKBACK_MINUTES,
                self.window_minutes
            ));
        }
        if self.concurrency.io == 0 || self.concurrency.cpu == 0 {
            return Err(anyhow!("concurrency limits must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be greater than zero"));
        }
        if self.retention.max_entries == 0 {
            return Err(anyhow!("retention.max_entries must be greater than zero"));
        }
        if let Some(max_age) = self
            .retention
            .max_age_minutes
            .filter(|m| *m > MAX_LOOKBACK_MINUTES)
        {
            return Err(anyhow!(
                "retention.max_age_minutes must be at most {}, got {}",
                MAX_LOOKBACK_MINUTES,
                max_age
            ));
        }
        if self.renderer.command.is_empty() {
            return Err(anyhow!("renderer.command must not be empty"));
        }
        Ok(())
    }

    pub fn window(&self) -> chrono::Duration {
        lookback(self.window_minutes)
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

/// Minutes as a chrono duration, clamped to [`MAX_LOOKBACK_MINUTES`].
fn lookback(minutes: u64) -> chrono::Duration {
    i64::try_from(minutes.min(MAX_LOOKBACK_MINUTES))
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .unwrap_or(chrono::Duration::zero())
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Otlp,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable metrics.
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    // If not specified, traces are not exported.
    #[serde(default)]
    pub tracing_exporter: Option<TracingExporter>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(10))]
    pub metrics_interval: Duration,
    // Used as the metric attribute "radar.instance.id".
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

// Durations are written as whole seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
