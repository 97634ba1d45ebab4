use std::{path::Path, process::Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::{BoundingBox, ProductDescriptor};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{RenderError, RenderedSweep, Renderer};
use crate::config::RendererConfig;

#[derive(Debug, Deserialize)]
struct RenderOutput {
    bbox: BoundingBox,
    #[serde(default)]
    elevation_angle_degrees: Option<f64>,
    #[serde(default)]
    azimuth_angle_degrees: Option<f64>,
}

/// Runs an external program per call:
///
/// ```text
/// {command} {args..} count  --input FILE --level L --product P
/// {command} {args..} render --input FILE --level L --product P [--code C] [--field F]
///                           --sweep N --output OUT.png
/// ```
///
/// `count` prints the number of sweeps. `render` writes the PNG to `--output`
/// and prints `{"bbox": {...}, "elevation_angle_degrees": .., "azimuth_angle_degrees": ..}`.
/// The child is killed when the returned future is dropped.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: String,
    args: Vec<String>,
}

struct Invocation {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

impl CommandRenderer {
    pub fn new(config: &RendererConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    async fn invoke(
        &self,
        work_dir: &Path,
        raw: &[u8],
        descriptor: &ProductDescriptor,
        subcommand: &str,
        extra_args: &[String],
    ) -> Result<Invocation, RenderError> {
        let input = work_dir.join("input.raw");
        tokio::fs::write(&input, raw).await?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(subcommand)
            .arg("--input")
            .arg(&input)
            .arg("--level")
            .arg(descriptor.level.as_ref())
            .arg("--product")
            .arg(&descriptor.product)
            .args(extra_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!(command = ?cmd, "invoking renderer");

        let output = cmd.output().await?;
        Ok(Invocation {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn check_status(invocation: &Invocation) -> Result<(), RenderError> {
        if invocation.status.success() {
            return Ok(());
        }
        Err(RenderError::Failed(format!(
            "exit status {}: {}",
            invocation.status,
            invocation.stderr.trim()
        )))
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn sweep_count(
        &self,
        raw: &[u8],
        descriptor: &ProductDescriptor,
    ) -> Result<u32, RenderError> {
        let work_dir = tempfile::tempdir()?;
        let invocation = self
            .invoke(work_dir.path(), raw, descriptor, "count", &[])
            .await?;
        Self::check_status(&invocation)?;
        invocation.stdout.trim().parse::<u32>().map_err(|e| {
            RenderError::InvalidOutput(format!(
                "sweep count {:?}: {}",
                invocation.stdout.trim(),
                e
            ))
        })
    }

    async fn render(
        &self,
        raw: &[u8],
        descriptor: &ProductDescriptor,
        sweep: Option<u32>,
    ) -> Result<RenderedSweep, RenderError> {
        let work_dir = tempfile::tempdir()?;
        let output = work_dir.path().join("output.png");

        let mut extra_args = Vec::new();
        if let Some(code) = &descriptor.code {
            extra_args.extend(["--code".to_string(), code.clone()]);
        }
        if let Some(field) = &descriptor.field {
            extra_args.extend(["--field".to_string(), field.clone()]);
        }
        extra_args.extend([
            "--sweep".to_string(),
            sweep.unwrap_or(0).to_string(),
            "--output".to_string(),
            output.to_string_lossy().into_owned(),
        ]);

        let invocation = self
            .invoke(work_dir.path(), raw, descriptor, "render", &extra_args)
            .await?;
        Self::check_status(&invocation)?;

        let parsed: RenderOutput = serde_json::from_str(invocation.stdout.trim())
            .map_err(|e| RenderError::InvalidOutput(format!("render metadata: {}", e)))?;
        if !parsed.bbox.is_valid() {
            return Err(RenderError::InvalidOutput(format!(
                "bounding box out of range: {:?}",
                parsed.bbox
            )));
        }
        let image = tokio::fs::read(&output)
            .await
            .map_err(|e| RenderError::InvalidOutput(format!("missing image: {}", e)))?;
        if image.is_empty() {
            return Err(RenderError::InvalidOutput("empty image".to_string()));
        }

        Ok(RenderedSweep {
            image: Bytes::from(image),
            bbox: parsed.bbox,
            elevation_angle_degrees: parsed.elevation_angle_degrees,
            azimuth_angle_degrees: parsed.azimuth_angle_degrees,
        })
    }
}
