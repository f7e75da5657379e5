use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::envelope::Envelope;
use crate::error::PipelineError;
use crate::message::Message;
use crate::metrics_consts::ACK_ATTEMPTS;
use crate::retry::RetryPolicy;
use crate::source::Acknowledger;

/// Wraps an [`Acknowledger`] so that transient failures are retried with backoff.
pub struct RetryAck<A> {
    acker: A,
    policy: RetryPolicy,
}

impl<A: Acknowledger> RetryAck<A> {
    pub fn new(acker: A, policy: RetryPolicy) -> Self {
        Self { acker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Acknowledge `record`, retrying until it succeeds or the policy runs out of
    /// attempts. Only the final error is returned.
    pub async fn ack(&self, record: &Message) -> Result<(), PipelineError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.acker.ack(record).await {
                Ok(()) => {
                    metrics::counter!(ACK_ATTEMPTS, "outcome" => "success").increment(1);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !self.policy.should_retry(attempt) {
                metrics::counter!(ACK_ATTEMPTS, "outcome" => "exhausted").increment(1);
                error!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset(),
                    attempt,
                    error = %err,
                    "acknowledgment failed, giving up"
                );
                return Err(PipelineError::Ack {
                    attempts: attempt,
                    source: err,
                });
            }

            let interval = self.policy.retry_interval(attempt);
            metrics::counter!(ACK_ATTEMPTS, "outcome" => "retry").increment(1);
            warn!(
                topic = record.topic(),
                partition = record.partition_number(),
                offset = record.offset(),
                attempt,
                retry_in_ms = interval.as_millis() as u64,
                error = %err,
                "retrying acknowledgment"
            );
            sleep(interval).await;
        }
    }
}

/// Terminal stage: acknowledges every envelope's record, strictly in arrival
/// order and one at a time. The next envelope is not read until the current
/// acknowledgment, retries included, has finished.
pub struct Sink<A> {
    retry: RetryAck<A>,
}

impl<A: Acknowledger> Sink<A> {
    pub fn new(acker: A, policy: RetryPolicy) -> Self {
        Self {
            retry: RetryAck::new(acker, policy),
        }
    }

    /// Consume `input` until it closes. Returns how many records were acknowledged.
    pub async fn run<T>(self, mut input: mpsc::Receiver<Envelope<T>>) -> Result<u64, PipelineError> {
        let mut acknowledged = 0;

        while let Some(envelope) = input.recv().await {
            let record = envelope.into_record();
            self.retry.ack(&record).await?;
            acknowledged += 1;
        }

        debug!(acknowledged, "sink input closed");
        Ok(acknowledged)
    }
}
