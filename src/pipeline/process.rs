use std::{future::Future, sync::Arc, time::Duration};

use data_model::{ArtifactKey, FetchedRecord, ProcessedArtifact, ProductDescriptor, RawFileRecord};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::{PipelineContext, StageTally};
use crate::{
    error::PipelineError,
    renderer::{RenderError, RenderedSweep, Renderer},
};

/// Everything the process stage produced for one raw file.
#[derive(Debug, Clone)]
pub struct RenderedRecord {
    pub record: RawFileRecord,
    pub artifacts: Vec<ProcessedArtifact>,
    /// Sweeps that failed to render. Single-sweep files use sweep 0.
    pub failed_sweeps: Vec<u32>,
}

impl RenderedRecord {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Renders every fetched record, at most `ctx.cpu_concurrency` renders at a
/// time. Multi-sweep files fan out one render per sweep; a failed sweep only
/// removes that sweep's artifact. A render that outlives `ctx.timeouts.render`
/// is dropped, which stops it before its slot is handed to the next one.
pub async fn process(
    ctx: &PipelineContext,
    fetched: Vec<FetchedRecord>,
    field: Option<&str>,
) -> (Vec<RenderedRecord>, StageTally) {
    let pool = RenderPool {
        renderer: ctx.renderer.clone(),
        semaphore: Arc::new(Semaphore::new(ctx.cpu_concurrency)),
        timeout: ctx.timeouts.render,
    };
    let attempted = fetched.len() as u64;

    let rendered: Vec<RenderedRecord> = join_all(
        fetched
            .into_iter()
            .map(|fetched| pool.render_record(fetched, field)),
    )
    .await;

    let produced = rendered.iter().filter(|r| !r.is_empty()).count() as u64;
    let artifacts: usize = rendered.iter().map(|r| r.artifacts.len()).sum();
    let failed_sweeps: usize = rendered.iter().map(|r| r.failed_sweeps.len()).sum();
    let tally = StageTally::new(attempted, produced);
    info!(%tally, artifacts, failed_sweeps, "process finished");
    (rendered, tally)
}

struct RenderPool {
    renderer: Arc<dyn Renderer>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl RenderPool {
    async fn render_record(&self, fetched: FetchedRecord, field: Option<&str>) -> RenderedRecord {
        let FetchedRecord { record, payload } = fetched;
        let descriptor = record.descriptor(field);

        let sweeps: Vec<Option<u32>> = if record.level.is_multi_sweep() {
            match self
                .bounded(self.renderer.sweep_count(&payload, &descriptor))
                .await
            {
                Ok(count) => (0..count).map(Some).collect(),
                Err(source) => {
                    let err = PipelineError::Render {
                        key: record.normalized_key.clone(),
                        sweep: None,
                        source,
                    };
                    warn!(error = %err, "unable to count sweeps, skipping record");
                    return RenderedRecord {
                        record,
                        artifacts: vec![],
                        failed_sweeps: vec![],
                    };
                }
            }
        } else {
            vec![None]
        };

        let results = join_all(sweeps.into_iter().map(|sweep| {
            let payload = &payload;
            let descriptor = &descriptor;
            async move {
                let result = self
                    .bounded(self.renderer.render(payload, descriptor, sweep))
                    .await;
                (sweep, result)
            }
        }))
        .await;

        let mut artifacts = Vec::new();
        let mut failed_sweeps = Vec::new();
        for (sweep, result) in results {
            match result {
                Ok(rendered) => artifacts.push(to_artifact(&record, &descriptor, sweep, rendered)),
                Err(source) => {
                    let err = PipelineError::Render {
                        key: record.normalized_key.clone(),
                        sweep,
                        source,
                    };
                    warn!(error = %err, "skipping sweep");
                    failed_sweeps.push(sweep.unwrap_or(0));
                }
            }
        }
        artifacts.sort_by_key(|a| a.key.sweep);
        failed_sweeps.sort_unstable();
        if record.level.is_multi_sweep() {
            rank_by_elevation(&mut artifacts);
        }

        RenderedRecord {
            record,
            artifacts,
            failed_sweeps,
        }
    }

    /// Holds a pool slot for the whole lifetime of `render`.
    async fn bounded<T>(
        &self,
        render: impl Future<Output = Result<T, RenderError>>,
    ) -> Result<T, RenderError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RenderError::Failed("render pool closed".to_string()))?;
        tokio::time::timeout(self.timeout, render)
            .await
            .unwrap_or(Err(RenderError::Timeout(self.timeout)))
    }
}

/// Sets the 1-based elevation rank of every sweep that reported an elevation
/// angle. Ties are broken by azimuth, then by sweep number.
fn rank_by_elevation(artifacts: &mut [ProcessedArtifact]) {
    let mut ranked: Vec<&mut ProcessedArtifact> = artifacts
        .iter_mut()
        .filter(|a| a.elevation_angle_degrees.is_some())
        .collect();
    ranked.sort_by(|a, b| {
        let angles = |x: &ProcessedArtifact| {
            (
                x.elevation_angle_degrees.unwrap_or_default(),
                x.azimuth_angle_degrees.unwrap_or_default(),
            )
        };
        let (a_elevation, a_azimuth) = angles(&**a);
        let (b_elevation, b_azimuth) = angles(&**b);
        a_elevation
            .total_cmp(&b_elevation)
            .then(a_azimuth.total_cmp(&b_azimuth))
            .then(a.sweep.cmp(&b.sweep))
    });
    for (rank, artifact) in ranked.into_iter().enumerate() {
        artifact.elevation_index = Some(rank as u32 + 1);
    }
}

fn to_artifact(
    record: &RawFileRecord,
    descriptor: &ProductDescriptor,
    sweep: Option<u32>,
    rendered: RenderedSweep,
) -> ProcessedArtifact {
    ProcessedArtifact {
        key: ArtifactKey::new(
            record.level,
            &record.normalized_key,
            &descriptor.product,
            sweep.unwrap_or(0),
        ),
        image: rendered.image,
        bbox: rendered.bbox,
        product: descriptor.product.clone(),
        sweep,
        elevation_index: None,
        elevation_angle_degrees: rendered.elevation_angle_degrees,
        azimuth_angle_degrees: rendered.azimuth_angle_degrees,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::Bytes;
    use data_model::{
        test_objects::tests::{level2_record, level3_record},
        BoundingBox,
    };

    use super::*;
    use crate::testing::{fetched, ScriptedRenderer, TestContext};

    #[tokio::test]
    async fn test_multi_sweep_fan_out_isolates_failures() {
        let renderer = ScriptedRenderer::new(4).fail_sweep(2);
        let test_ctx = TestContext::with_renderer(renderer).await;
        let record = level2_record(0);

        let (rendered, tally) =
            process(&test_ctx.ctx, vec![fetched(record.clone())], Some("reflectivity")).await;

        assert_eq!(StageTally::new(1, 1), tally);
        assert_eq!(1, rendered.len());
        let rendered = &rendered[0];
        assert_eq!(vec![2], rendered.failed_sweeps);
        assert_eq!(
            vec![
                "plots_level2/KPDT20250409_120000_V06_reflectivity_idx0.png",
                "plots_level2/KPDT20250409_120000_V06_reflectivity_idx1.png",
                "plots_level2/KPDT20250409_120000_V06_reflectivity_idx3.png",
            ],
            rendered
                .artifacts
                .iter()
                .map(|a| a.key.image_key())
                .collect::<Vec<_>>()
        );
        assert_eq!(Some(3), rendered.artifacts[2].sweep);
    }

    #[tokio::test]
    async fn test_single_sweep_uses_index_zero() {
        let test_ctx = TestContext::with_renderer(ScriptedRenderer::new(1)).await;
        let record = level3_record("hydrometeor", "HHC", 0);

        let (rendered, _) = process(&test_ctx.ctx, vec![fetched(record)], None).await;
        let artifact = &rendered[0].artifacts[0];
        assert_eq!(None, artifact.sweep);
        assert_eq!(
            "plots_level3/KPDT20250409_120000_HHC_hydrometeor_idx0.png",
            artifact.key.image_key()
        );
    }

    #[tokio::test]
    async fn test_failed_record_does_not_affect_others() {
        let records: Vec<_> = (0..4).map(|i| level3_record("hydrometeor", "HHC", i)).collect();
        let renderer = ScriptedRenderer::new(1).fail_key(&records[1].normalized_key);
        let test_ctx = TestContext::with_renderer(renderer).await;

        let (rendered, tally) = process(
            &test_ctx.ctx,
            records.iter().cloned().map(fetched).collect(),
            None,
        )
        .await;

        assert_eq!(StageTally::new(4, 3), tally);
        let failed: Vec<_> = rendered.iter().filter(|r| r.is_empty()).collect();
        assert_eq!(1, failed.len());
        assert_eq!(records[1], failed[0].record);
        assert_eq!(vec![0], failed[0].failed_sweeps);
    }

    #[tokio::test]
    async fn test_sweep_count_failure_skips_record() {
        let record = level2_record(0);
        let renderer = ScriptedRenderer::new(3).fail_count();
        let test_ctx = TestContext::with_renderer(renderer).await;

        let (rendered, tally) = process(&test_ctx.ctx, vec![fetched(record)], None).await;
        assert_eq!(StageTally::new(1, 0), tally);
        assert!(rendered[0].is_empty());
    }

    #[tokio::test]
    async fn test_render_timeout_releases_slot_only_when_render_stops() {
        let renderer = ScriptedRenderer::new(1).delay(Duration::from_millis(400));
        let mut test_ctx = TestContext::with_renderer(renderer.clone()).await;
        test_ctx.ctx.cpu_concurrency = 1;
        test_ctx.ctx.timeouts.render = Duration::from_millis(50);
        let records: Vec<_> = (0..4).map(|i| level3_record("hydrometeor", "HHC", i)).collect();

        let started = Instant::now();
        let (rendered, tally) =
            process(&test_ctx.ctx, records.into_iter().map(fetched).collect(), None).await;

        assert_eq!(StageTally::new(4, 0), tally);
        assert!(rendered.iter().all(|r| r.failed_sweeps == vec![0]));
        assert_eq!(1, renderer.peak_in_flight());
        assert_eq!(0, renderer.in_flight());
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_multi_sweep_artifacts_carry_elevation_rank() {
        let test_ctx = TestContext::with_renderer(ScriptedRenderer::new(3)).await;
        let (rendered, _) =
            process(&test_ctx.ctx, vec![fetched(level2_record(0))], Some("reflectivity")).await;
        assert_eq!(
            vec![Some(1), Some(2), Some(3)],
            rendered[0]
                .artifacts
                .iter()
                .map(|a| a.elevation_index)
                .collect::<Vec<_>>()
        );

        let (rendered, _) = process(
            &test_ctx.ctx,
            vec![fetched(level3_record("hydrometeor", "HHC", 0))],
            None,
        )
        .await;
        assert_eq!(None, rendered[0].artifacts[0].elevation_index);
    }

    #[test]
    fn test_rank_by_elevation_orders_by_angle_then_azimuth() {
        let record = level2_record(0);
        let descriptor = record.descriptor(Some("reflectivity"));
        let artifact = |sweep: u32, elevation: Option<f64>, azimuth: Option<f64>| {
            to_artifact(
                &record,
                &descriptor,
                Some(sweep),
                RenderedSweep {
                    image: Bytes::from_static(b"png"),
                    bbox: BoundingBox {
                        min_lon: -121.0,
                        min_lat: 43.5,
                        max_lon: -116.5,
                        max_lat: 47.8,
                    },
                    elevation_angle_degrees: elevation,
                    azimuth_angle_degrees: azimuth,
                },
            )
        };
        let mut artifacts = vec![
            artifact(0, Some(0.5), Some(10.0)),
            artifact(1, Some(0.5), Some(5.0)),
            artifact(2, Some(1.5), None),
            artifact(3, Some(0.9), None),
            artifact(4, None, None),
        ];

        rank_by_elevation(&mut artifacts);
        assert_eq!(
            vec![Some(2), Some(1), Some(4), Some(3), None],
            artifacts.iter().map(|a| a.elevation_index).collect::<Vec<_>>()
        );
    }
}
