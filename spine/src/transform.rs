use std::future::Future;
use std::marker::PhantomData;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::{Envelope, Input};
use crate::error::PipelineError;
use crate::metrics_consts::TRANSFORM_MESSAGES;

/// Per-message stage: runs a user function on every envelope, one at a time.
///
/// The function receives the previous stage's derived value, or the decoded
/// record if nothing has been derived yet. Its result becomes the derived value
/// of the outgoing envelope; `None` leaves the envelope raw. The record itself
/// always passes through untouched so the sink can acknowledge it.
pub struct MessageTransform<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> MessageTransform<I, O, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }

    /// Apply the user function to a single envelope.
    pub async fn apply<Fut>(&self, envelope: Envelope<I>) -> Result<Envelope<O>, PipelineError>
    where
        F: Fn(Input<I>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<O>>>,
    {
        let (record, input) = envelope.into_input();

        match (self.f)(input).await {
            Ok(result) => {
                metrics::counter!(TRANSFORM_MESSAGES, "outcome" => "success").increment(1);
                debug!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset(),
                    derived = result.is_some(),
                    "transformed message"
                );
                Ok(Envelope::from_result(record, result))
            }
            Err(e) => {
                metrics::counter!(TRANSFORM_MESSAGES, "outcome" => "error").increment(1);
                warn!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset(),
                    error = %e,
                    "transform failed, halting stage"
                );
                Err(PipelineError::Transform(e))
            }
        }
    }

    /// Consume `input` until it closes, forwarding each result to `output` in order.
    /// Returns on the first failure without reading any further input.
    pub async fn run<Fut>(
        self,
        mut input: mpsc::Receiver<Envelope<I>>,
        output: mpsc::Sender<Envelope<O>>,
    ) -> Result<(), PipelineError>
    where
        F: Fn(Input<I>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<O>>>,
    {
        while let Some(envelope) = input.recv().await {
            let envelope = self.apply(envelope).await?;
            output
                .send(envelope)
                .await
                .map_err(|_| PipelineError::DownstreamClosed { stage: "transform" })?;
        }

        debug!("transform input closed");
        Ok(())
    }
}
