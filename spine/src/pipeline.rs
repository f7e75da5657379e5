use std::future::Future;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::chunked::ChunkedBatcher;
use crate::envelope::{Envelope, Input};
use crate::error::PipelineError;
use crate::metrics_consts::{PIPELINE_ERRORS, SOURCE_MESSAGES_RECEIVED};
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::source::{Acknowledger, MessageSource};
use crate::transform::MessageTransform;

type StageFuture = BoxFuture<'static, Result<(), PipelineError>>;

/// A partially built pipeline whose last stage emits `Envelope<T>`.
///
/// Each stage added here is only a future; nothing runs until the pipeline is
/// terminated with [`Pipeline::sink`] and [`RunnablePipeline::run`] is awaited.
pub struct Pipeline<T> {
    stages: Vec<StageFuture>,
    output: mpsc::Receiver<Envelope<T>>,
    capacity: usize,
}

impl Pipeline<()> {
    /// Start a pipeline reading from `source`. `capacity` bounds every channel
    /// between stages and is raised to 1 if zero.
    pub fn from_source<S>(source: S, capacity: usize) -> Self
    where
        S: MessageSource + 'static,
    {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        Self {
            stages: vec![read_source(source, tx).boxed()],
            output: rx,
            capacity,
        }
    }
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the channel capacity used by stages added from here on.
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Append a per-message stage.
    pub fn transform<O, F, Fut>(self, f: F) -> Pipeline<O>
    where
        O: Send + 'static,
        F: Fn(Input<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<O>>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.capacity);
        let stage = MessageTransform::new(f).run(self.output, tx).boxed();

        Pipeline {
            stages: push(self.stages, stage),
            output: rx,
            capacity: self.capacity,
        }
    }

    /// Append a batching stage flushing every `batch_size` envelopes or
    /// `timeout` after the first pending one arrived.
    pub fn chunked_transform<O, F, Fut>(
        self,
        f: F,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Pipeline<O>, PipelineError>
    where
        O: Send + 'static,
        F: Fn(Input<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<O>>> + Send + 'static,
    {
        let batcher = ChunkedBatcher::new(f, batch_size, timeout)?;
        debug!(
            batch_size = batcher.batch_size(),
            timeout = ?batcher.timeout(),
            "adding chunked transform stage"
        );
        let (tx, rx) = mpsc::channel(self.capacity);
        let input = self.output;

        let stage = async move {
            let stats = batcher.run(input, tx).await?;
            debug!(
                size_flushes = stats.size_flushes,
                timeout_flushes = stats.timeout_flushes,
                drain_flushes = stats.drain_flushes,
                "chunked transform finished"
            );
            Ok(())
        }
        .boxed();

        Ok(Pipeline {
            stages: push(self.stages, stage),
            output: rx,
            capacity: self.capacity,
        })
    }

    /// Terminate the pipeline with an acknowledging sink.
    pub fn sink<A>(self, acker: A, policy: RetryPolicy) -> RunnablePipeline
    where
        A: Acknowledger + 'static,
    {
        RunnablePipeline {
            stages: self.stages,
            sink: Sink::new(acker, policy).run(self.output).boxed(),
        }
    }
}

fn push(mut stages: Vec<StageFuture>, stage: StageFuture) -> Vec<StageFuture> {
    stages.push(stage);
    stages
}

async fn read_source<S>(mut source: S, output: mpsc::Sender<Envelope<()>>) -> Result<(), PipelineError>
where
    S: MessageSource,
{
    while let Some(record) = source.next().await.map_err(PipelineError::Source)? {
        metrics::counter!(SOURCE_MESSAGES_RECEIVED).increment(1);
        output
            .send(Envelope::new(record))
            .await
            .map_err(|_| PipelineError::DownstreamClosed { stage: "source" })?;
    }

    debug!("source exhausted");
    Ok(())
}

/// Outcome of a pipeline that ran until its source was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub acknowledged: u64,
}

/// A complete pipeline, ready to be driven.
pub struct RunnablePipeline {
    stages: Vec<StageFuture>,
    sink: BoxFuture<'static, Result<u64, PipelineError>>,
}

impl RunnablePipeline {
    /// Drive every stage concurrently within the calling task until the source
    /// ends and everything has been acknowledged, or until the first stage fails.
    /// On failure the remaining stages are dropped in place.
    pub async fn run(self) -> Result<PipelineSummary, PipelineError> {
        let stage_count = self.stages.len();
        debug!(stages = stage_count, "starting pipeline");

        match future::try_join(future::try_join_all(self.stages), self.sink).await {
            Ok((_, acknowledged)) => {
                info!(acknowledged, "pipeline finished");
                Ok(PipelineSummary { acknowledged })
            }
            Err(e) => {
                metrics::counter!(PIPELINE_ERRORS, "kind" => e.kind()).increment(1);
                error!(kind = e.kind(), error = %e, "pipeline failed");
                Err(e)
            }
        }
    }
}
