use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::envelope::Input;
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, RunnablePipeline};
use crate::retry::RetryPolicy;
use crate::source::{Acknowledger, MessageSource};

/// Size and timeout applied by [`SpinePipeline::chunked_transform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

/// Bundles a source, the acknowledger for its records and the settings shared
/// by every stage, so that application code only supplies its functions.
pub struct Spine<S, A> {
    source: S,
    acker: A,
    config: Config,
}

impl<S, A> Spine<S, A>
where
    S: MessageSource + 'static,
    A: Acknowledger + 'static,
{
    pub fn new(source: S, acker: A, config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            source,
            acker,
            config,
        })
    }

    pub fn ack_policy(&self) -> RetryPolicy {
        self.config.ack_policy()
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.config.batch_size,
            flush_timeout: self.config.flush_timeout(),
        }
    }

    /// Start a pipeline over the raw records of the source.
    pub fn pipeline(self) -> SpinePipeline<A, ()> {
        let batch = self.batch_settings();
        let policy = self.ack_policy();

        SpinePipeline {
            inner: Pipeline::from_source(self.source, self.config.downstream_buffer_capacity),
            acker: self.acker,
            policy,
            batch,
        }
    }
}

/// A [`Pipeline`] that remembers its acknowledger and the configured settings.
pub struct SpinePipeline<A, T> {
    inner: Pipeline<T>,
    acker: A,
    policy: RetryPolicy,
    batch: BatchSettings,
}

impl<A, T> SpinePipeline<A, T>
where
    A: Acknowledger + 'static,
    T: Send + 'static,
{
    pub fn transform<O, F, Fut>(self, f: F) -> SpinePipeline<A, O>
    where
        O: Send + 'static,
        F: Fn(Input<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<O>>> + Send + 'static,
    {
        SpinePipeline {
            inner: self.inner.transform(f),
            acker: self.acker,
            policy: self.policy,
            batch: self.batch,
        }
    }

    /// Batch with the configured size and flush timeout.
    pub fn chunked_transform<O, F, Fut>(self, f: F) -> Result<SpinePipeline<A, O>, PipelineError>
    where
        O: Send + 'static,
        F: Fn(Input<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<O>>> + Send + 'static,
    {
        let BatchSettings {
            batch_size,
            flush_timeout,
        } = self.batch;
        self.chunked_transform_with(f, batch_size, flush_timeout)
    }

    pub fn chunked_transform_with<O, F, Fut>(
        self,
        f: F,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<SpinePipeline<A, O>, PipelineError>
    where
        O: Send + 'static,
        F: Fn(Input<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<O>>> + Send + 'static,
    {
        Ok(SpinePipeline {
            inner: self.inner.chunked_transform(f, batch_size, timeout)?,
            acker: self.acker,
            policy: self.policy,
            batch: self.batch,
        })
    }

    /// Acknowledge everything that reaches the end of the pipeline.
    pub fn sink(self) -> RunnablePipeline {
        self.inner.sink(self.acker, self.policy)
    }
}
