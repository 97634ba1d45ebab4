use crate::renderer::RenderError;

/// Failure taxonomy of a pipeline run.
///
/// Only [`PipelineError::SourceUnavailable`] and
/// [`PipelineError::Consistency`] end a product run; the other variants are
/// absorbed by the stage that produced them.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("source archive unavailable. prefix: {prefix}, error: {source:#}")]
    SourceUnavailable {
        prefix: String,
        source: anyhow::Error,
    },

    #[error("transient I/O failure. operation: {operation}, key: {key}, error: {source:#}")]
    TransientIo {
        operation: &'static str,
        key: String,
        source: anyhow::Error,
    },

    #[error("render failed. key: {key}, sweep: {sweep:?}, error: {source}")]
    Render {
        key: String,
        sweep: Option<u32>,
        source: RenderError,
    },

    #[error("index document read or write failed. document: {document}, error: {source:#}")]
    Consistency {
        document: String,
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Identifies failures that end the product run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::Consistency { .. }
        )
    }
}
