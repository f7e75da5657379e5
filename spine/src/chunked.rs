use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use futures::stream::{FuturesOrdered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::envelope::{Envelope, Input};
use crate::error::PipelineError;
use crate::metrics_consts::{BATCH_FLUSHES, BATCH_FLUSH_DURATION_MS, BATCH_MESSAGES, BATCH_SIZE};

/// What caused a pending batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached the configured size.
    Size,
    /// The flush timer fired with a partial batch.
    Timeout,
    /// Upstream closed with a partial batch still pending.
    Drain,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Drain => "drain",
        }
    }
}

/// Running totals for one batcher, returned when its input closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub size_flushes: u64,
    pub timeout_flushes: u64,
    pub drain_flushes: u64,
    pub messages_flushed: u64,
    pub messages_emitted: u64,
}

impl BatchStats {
    pub fn flushes(&self) -> u64 {
        self.size_flushes + self.timeout_flushes + self.drain_flushes
    }

    fn record_flush(&mut self, trigger: FlushTrigger, batch_size: usize) {
        match trigger {
            FlushTrigger::Size => self.size_flushes += 1,
            FlushTrigger::Timeout => self.timeout_flushes += 1,
            FlushTrigger::Drain => self.drain_flushes += 1,
        }
        self.messages_flushed += batch_size as u64;
    }
}

/// The pending batch. Single owner; only ever emptied by `take`, which swaps in
/// a fresh buffer so that anything pushed afterwards lands in the next batch.
struct Batch<T> {
    items: Vec<Envelope<T>>,
    limit: usize,
}

impl<T> Batch<T> {
    fn new(limit: usize) -> Self {
        Self {
            items: Vec::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, envelope: Envelope<T>) {
        self.items.push(envelope);
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }

    fn take(&mut self) -> Vec<Envelope<T>> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.limit))
    }
}

/// Batching stage: collects up to `batch_size` envelopes, runs the user
/// function over all of them concurrently and re-emits the results one at a
/// time.
///
/// A batch is flushed as soon as it is full, or once `timeout` has passed since
/// its first envelope arrived. While a flush is running the stage reads no new
/// input; arrivals wait in the inbound channel and make up the next batch.
///
/// The per-item calls run concurrently, but results are emitted in input
/// order, each paired with the record it was computed from, so downstream
/// acknowledgments never overtake an earlier record of the same flush. An item
/// whose call returns `None` is not forwarded. Emission waits for room in the
/// downstream channel rather than dropping anything. If a call fails, emission
/// stops at that item: results before it stay emitted, nothing after it is
/// emitted, and the error terminates the stage.
pub struct ChunkedBatcher<I, O, F> {
    f: F,
    timeout: Duration,
    pending: Batch<I>,
    stats: BatchStats,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> ChunkedBatcher<I, O, F> {
    pub fn new(f: F, batch_size: usize, timeout: Duration) -> Result<Self, PipelineError> {
        if batch_size < 2 {
            return Err(PipelineError::Config(format!(
                "chunked transform needs a batch size of at least 2, got {batch_size}"
            )));
        }
        if timeout.is_zero() {
            return Err(PipelineError::Config(
                "chunked transform needs a non-zero flush timeout".to_string(),
            ));
        }

        Ok(Self {
            f,
            timeout,
            pending: Batch::new(batch_size),
            stats: BatchStats::default(),
            _marker: PhantomData,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.pending.limit
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive the stage until `input` closes. Whatever is still pending at that
    /// point is flushed before returning.
    pub async fn run<Fut>(
        mut self,
        mut input: mpsc::Receiver<Envelope<I>>,
        output: mpsc::Sender<Envelope<O>>,
    ) -> Result<BatchStats, PipelineError>
    where
        F: Fn(Input<I>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<O>>>,
    {
        // One-shot flush timer for the batch currently accumulating. Armed by the
        // first arrival, cleared by any flush.
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                // an expired timer wins over a racing arrival, which then
                // starts the next batch
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if !self.pending.is_empty() {
                        self.flush(FlushTrigger::Timeout, &output).await?;
                    }
                }

                received = input.recv() => {
                    let Some(envelope) = received else {
                        break;
                    };

                    self.pending.push(envelope);
                    if self.pending.is_full() {
                        deadline = None;
                        self.flush(FlushTrigger::Size, &output).await?;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + self.timeout);
                    }
                }
            }
        }

        if !self.pending.is_empty() {
            self.flush(FlushTrigger::Drain, &output).await?;
        }

        debug!(
            flushes = self.stats.flushes(),
            messages_flushed = self.stats.messages_flushed,
            messages_emitted = self.stats.messages_emitted,
            "chunked transform input closed"
        );
        Ok(self.stats)
    }

    async fn flush<Fut>(
        &mut self,
        trigger: FlushTrigger,
        output: &mpsc::Sender<Envelope<O>>,
    ) -> Result<(), PipelineError>
    where
        F: Fn(Input<I>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<O>>>,
    {
        let batch = self.pending.take();
        let batch_size = batch.len();
        let started = std::time::Instant::now();

        self.stats.record_flush(trigger, batch_size);
        metrics::counter!(BATCH_FLUSHES, "trigger" => trigger.as_str()).increment(1);
        metrics::histogram!(BATCH_SIZE).record(batch_size as f64);
        debug!(trigger = trigger.as_str(), batch_size, "flushing batch");

        let f = &self.f;
        let mut in_flight: FuturesOrdered<_> = batch
            .into_iter()
            .map(|envelope| {
                let (record, input) = envelope.into_input();
                let result = f(input);
                async move { (record, result.await) }
            })
            .collect();

        let mut emitted = 0;
        while let Some((record, result)) = in_flight.next().await {
            match result {
                Ok(Some(value)) => {
                    metrics::counter!(BATCH_MESSAGES, "outcome" => "success").increment(1);
                    output
                        .send(Envelope::from_result(record, Some(value)))
                        .await
                        .map_err(|_| PipelineError::DownstreamClosed {
                            stage: "chunked_transform",
                        })?;
                    emitted += 1;
                }
                Ok(None) => {
                    metrics::counter!(BATCH_MESSAGES, "outcome" => "dropped").increment(1);
                    debug!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset(),
                        "batch function returned no value, message not forwarded"
                    );
                }
                Err(e) => {
                    metrics::counter!(BATCH_MESSAGES, "outcome" => "error").increment(1);
                    warn!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset(),
                        batch_size,
                        emitted,
                        error = %e,
                        "batch item failed, abandoning flush"
                    );
                    self.stats.messages_emitted += emitted;
                    return Err(PipelineError::BatchFlush {
                        batch_size,
                        source: e,
                    });
                }
            }
        }

        self.stats.messages_emitted += emitted;
        metrics::histogram!(BATCH_FLUSH_DURATION_MS).record(started.elapsed().as_millis() as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::sleep;

    use super::*;
    use crate::test_utils::make_message;

    async fn double(input: Input<()>) -> anyhow::Result<Option<i64>> {
        let value: i64 = input.raw().expect("raw record").value.parse()?;
        Ok(Some(value * 2))
    }

    fn envelopes(values: &[i64]) -> Vec<Envelope<()>> {
        values
            .iter()
            .enumerate()
            .map(|(offset, v)| Envelope::new(make_message(offset as i64, &v.to_string())))
            .collect()
    }

    async fn drain<T>(rx: &mut mpsc::Receiver<Envelope<T>>) -> Vec<Envelope<T>> {
        let mut out = vec![];
        while let Some(envelope) = rx.recv().await {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_rejects_batch_size_below_two() {
        for size in [0, 1] {
            let err = ChunkedBatcher::<(), i64, _>::new(double, size, Duration::from_millis(10))
                .err()
                .expect("batch size below two is rejected");
            assert!(matches!(err, PipelineError::Config(_)));
        }

        assert!(ChunkedBatcher::<(), i64, _>::new(double, 2, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = ChunkedBatcher::<(), i64, _>::new(double, 4, Duration::ZERO)
            .err()
            .expect("zero timeout is rejected");
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_reports_configured_limits() {
        let batcher = ChunkedBatcher::<(), i64, _>::new(double, 8, Duration::from_millis(25)).unwrap();
        assert_eq!(batcher.batch_size(), 8);
        assert_eq!(batcher.timeout(), Duration::from_millis(25));
    }

    #[test]
    fn test_take_swaps_in_empty_batch() {
        let mut batch = Batch::new(2);
        for envelope in envelopes(&[1, 2]) {
            batch.push(envelope);
        }
        assert!(batch.is_full());

        let taken = batch.take();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty());

        batch.push(Envelope::new(make_message(9, "3")));
        assert!(!batch.is_empty());
        assert!(!batch.is_full());
        assert_eq!(taken.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batches_flush_by_size() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        for envelope in envelopes(&[2, 4, 6, 8, 10, 12, 14, 16]) {
            in_tx.send(envelope).await.unwrap();
        }
        drop(in_tx);

        let batcher = ChunkedBatcher::new(double, 4, Duration::from_secs(1)).unwrap();
        let stats = batcher.run(in_rx, out_tx).await.unwrap();

        assert_eq!(stats.size_flushes, 2);
        assert_eq!(stats.flushes(), 2);
        assert_eq!(stats.messages_flushed, 8);
        assert_eq!(stats.messages_emitted, 8);

        let out = drain(&mut out_rx).await;
        let offsets: Vec<i64> = out.iter().map(|e| e.record().offset()).collect();
        let derived: Vec<i64> = out.iter().map(|e| *e.derived().unwrap()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(derived, vec![4, 8, 12, 16, 20, 24, 28, 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_once_after_timeout() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let batcher = ChunkedBatcher::new(double, 4, Duration::from_millis(10)).unwrap();
        let handle = tokio::spawn(batcher.run(in_rx, out_tx));

        for envelope in envelopes(&[2, 4, 6]) {
            in_tx.send(envelope).await.unwrap();
        }

        sleep(Duration::from_millis(5)).await;
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));

        sleep(Duration::from_millis(10)).await;
        let mut derived = vec![];
        for _ in 0..3 {
            derived.push(*out_rx.recv().await.unwrap().derived().unwrap());
        }
        derived.sort();
        assert_eq!(derived, vec![4, 8, 12]);

        // nothing else shows up while the stage idles
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));

        drop(in_tx);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.timeout_flushes, 1);
        assert_eq!(stats.flushes(), 1);
        assert_eq!(stats.messages_flushed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrivals_during_flush_start_a_new_batch() {
        let calls = Arc::new(Mutex::new(vec![]));
        let f = {
            let calls = calls.clone();
            move |input: Input<()>| {
                let calls = calls.clone();
                async move {
                    let value: i64 = input.raw().expect("raw record").value.parse()?;
                    calls.lock().unwrap().push(value);
                    sleep(Duration::from_millis(20)).await;
                    anyhow::Ok(Some(value))
                }
            }
        };

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let batcher = ChunkedBatcher::new(f, 3, Duration::from_millis(10)).unwrap();
        let handle = tokio::spawn(batcher.run(in_rx, out_tx));

        for envelope in envelopes(&[1, 2]) {
            in_tx.send(envelope).await.unwrap();
        }

        // timer flush of [1, 2] is now in progress
        sleep(Duration::from_millis(15)).await;
        for value in [3, 4, 5] {
            in_tx
                .send(Envelope::new(make_message(value, &value.to_string())))
                .await
                .unwrap();
        }
        drop(in_tx);

        let out = drain(&mut out_rx).await;
        assert_eq!(out.len(), 5);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.timeout_flushes, 1);
        assert_eq!(stats.size_flushes, 1);
        assert_eq!(stats.messages_flushed, 5);

        let mut seen = calls.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_result_skips_only_that_item() {
        let f = |input: Input<()>| async move {
            let value: i64 = input.raw().expect("raw record").value.parse()?;
            anyhow::Ok((value != 4).then_some(value))
        };

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for envelope in envelopes(&[2, 4, 6, 8]) {
            in_tx.send(envelope).await.unwrap();
        }
        drop(in_tx);

        let stats = ChunkedBatcher::new(f, 4, Duration::from_secs(1))
            .unwrap()
            .run(in_rx, out_tx)
            .await
            .unwrap();

        let out = drain(&mut out_rx).await;
        let pairs: Vec<(i64, i64)> = out
            .iter()
            .map(|e| (e.record().offset(), *e.derived().unwrap()))
            .collect();
        assert_eq!(pairs, vec![(0, 2), (2, 6), (3, 8)]);
        assert_eq!(stats.messages_flushed, 4);
        assert_eq!(stats.messages_emitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_input_order_despite_uneven_latency() {
        let f = |input: Input<()>| async move {
            let value: u64 = input.raw().expect("raw record").value.parse()?;
            // earlier items take longest
            sleep(Duration::from_millis((4 - value) * 10)).await;
            anyhow::Ok(Some(value))
        };

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for value in 0..4 {
            in_tx
                .send(Envelope::new(make_message(value, &value.to_string())))
                .await
                .unwrap();
        }
        drop(in_tx);

        let started = Instant::now();
        ChunkedBatcher::new(f, 4, Duration::from_secs(1))
            .unwrap()
            .run(in_rx, out_tx)
            .await
            .unwrap();

        // calls overlap: the flush takes as long as the slowest item
        assert_eq!(started.elapsed(), Duration::from_millis(40));

        let offsets: Vec<i64> = drain(&mut out_rx)
            .await
            .iter()
            .map(|e| e.record().offset())
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_stops_emission_at_its_position() {
        let f = |input: Input<()>| async move {
            let value: i64 = input.raw().expect("raw record").value.parse()?;
            if value == 4 {
                sleep(Duration::from_millis(50)).await;
                anyhow::bail!("cannot process {value}");
            }
            anyhow::Ok(Some(value))
        };

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for envelope in envelopes(&[2, 4, 6, 8]) {
            in_tx.send(envelope).await.unwrap();
        }

        let err = ChunkedBatcher::new(f, 4, Duration::from_secs(1))
            .unwrap()
            .run(in_rx, out_tx)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::BatchFlush { batch_size: 4, .. }));

        // 6 and 8 finished first but sit behind the failed item
        let offsets: Vec<i64> = drain(&mut out_rx)
            .await
            .iter()
            .map(|e| e.record().offset())
            .collect();
        assert_eq!(offsets, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_wins_over_racing_arrival() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let batcher = ChunkedBatcher::new(double, 4, Duration::from_millis(10)).unwrap();
        let handle = tokio::spawn(batcher.run(in_rx, out_tx));

        in_tx.send(Envelope::new(make_message(0, "1"))).await.unwrap();
        sleep(Duration::from_millis(5)).await;
        in_tx.send(Envelope::new(make_message(1, "2"))).await.unwrap();

        // the next arrival lands in the channel at the same instant the timer expires
        sleep(Duration::from_millis(5)).await;
        in_tx.send(Envelope::new(make_message(2, "3"))).await.unwrap();
        drop(in_tx);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.timeout_flushes, 1);
        assert_eq!(stats.drain_flushes, 1);
        assert_eq!(drain(&mut out_rx).await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_aborts_flush_after_earlier_items_emitted() {
        let f = |input: Input<()>| async move {
            let value: i64 = input.raw().expect("raw record").value.parse()?;
            if value == 6 {
                sleep(Duration::from_millis(10)).await;
                anyhow::bail!("cannot process {value}");
            }
            anyhow::Ok(Some(value))
        };

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for envelope in envelopes(&[2, 4, 6, 8]) {
            in_tx.send(envelope).await.unwrap();
        }

        let err = ChunkedBatcher::new(f, 4, Duration::from_secs(1))
            .unwrap()
            .run(in_rx, out_tx)
            .await
            .unwrap_err();

        match err {
            PipelineError::BatchFlush { batch_size, source } => {
                assert_eq!(batch_size, 4);
                assert_eq!(source.to_string(), "cannot process 6");
            }
            other => panic!("unexpected error: {other}"),
        }

        let emitted: Vec<i64> = drain(&mut out_rx)
            .await
            .iter()
            .map(|e| *e.derived().unwrap())
            .collect();
        assert_eq!(emitted, vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_downstream_delays_without_loss() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(1);

        for envelope in envelopes(&[2, 4, 6, 8, 10, 12, 14, 16]) {
            in_tx.send(envelope).await.unwrap();
        }
        drop(in_tx);

        let batcher = ChunkedBatcher::new(double, 4, Duration::from_secs(1)).unwrap();
        let handle = tokio::spawn(batcher.run(in_rx, out_tx));

        // let the stage fill the single slot and block on the next send
        sleep(Duration::from_millis(5)).await;
        assert!(!handle.is_finished());

        let mut received = vec![];
        while let Some(envelope) = out_rx.recv().await {
            received.push(*envelope.derived().unwrap());
            sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(received, vec![4, 8, 12, 16, 20, 24, 28, 32]);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.messages_emitted, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_input_drains_partial_batch() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for envelope in envelopes(&[2, 4, 6]) {
            in_tx.send(envelope).await.unwrap();
        }
        drop(in_tx);

        let stats = ChunkedBatcher::new(double, 4, Duration::from_secs(60))
            .unwrap()
            .run(in_rx, out_tx)
            .await
            .unwrap();

        assert_eq!(stats.drain_flushes, 1);
        assert_eq!(stats.timeout_flushes, 0);
        assert_eq!(drain(&mut out_rx).await.len(), 3);
    }
}
