//! Boundary to the radar rendering algorithm.
//!
//! The pipeline only needs two things from a renderer: how many sweeps a raw
//! file holds, and one image plus its geographic extents per sweep. Callers
//! bound both calls with a timeout and drop the future when it fires, so an
//! implementation must stop its work on drop. In-process renderers run their
//! CPU work on blocking worker threads.

pub mod command;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use data_model::{BoundingBox, ProductDescriptor};

pub use command::CommandRenderer;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer failed: {0}")]
    Failed(String),

    #[error("renderer timed out after {0:?}")]
    Timeout(Duration),

    #[error("renderer produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("renderer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One rendered sweep.
#[derive(Debug, Clone)]
pub struct RenderedSweep {
    pub image: Bytes,
    pub bbox: BoundingBox,
    pub elevation_angle_degrees: Option<f64>,
    pub azimuth_angle_degrees: Option<f64>,
}

#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Number of sweeps in a multi-sweep volume. Single-sweep products are
    /// never asked.
    async fn sweep_count(
        &self,
        raw: &[u8],
        descriptor: &ProductDescriptor,
    ) -> Result<u32, RenderError>;

    /// Renders `sweep` of the file, or the whole file when `sweep` is `None`.
    async fn render(
        &self,
        raw: &[u8],
        descriptor: &ProductDescriptor,
        sweep: Option<u32>,
    ) -> Result<RenderedSweep, RenderError>;
}
