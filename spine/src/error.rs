use thiserror::Error;

/// Fatal errors that terminate a pipeline.
///
/// Every stage returns one of these to the future driving the pipeline; the
/// first one observed wins and the remaining stages are dropped. Nothing in
/// here is retried by the pipeline itself: transient acknowledgment failures
/// are retried inside the sink and only surface as [`PipelineError::Ack`]
/// once the retry policy is exhausted.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transform failed: {0:#}")]
    Transform(#[source] anyhow::Error),

    #[error("batch flush of {batch_size} messages failed: {source:#}")]
    BatchFlush {
        batch_size: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("acknowledgment failed after {attempts} attempts: {source:#}")]
    Ack {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("source failed: {0:#}")]
    Source(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("downstream of {stage} stage closed")]
    DownstreamClosed { stage: &'static str },
}

impl PipelineError {
    /// Short, stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Transform(_) => "transform",
            PipelineError::BatchFlush { .. } => "batch_flush",
            PipelineError::Ack { .. } => "ack",
            PipelineError::Source(_) => "source",
            PipelineError::Config(_) => "config",
            PipelineError::DownstreamClosed { .. } => "downstream_closed",
        }
    }
}
