use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{Message, Partition};
use crate::source::{Acknowledger, Disconnect, MessageSource};

/// Test utilities for pipeline tests
pub fn make_message(offset: i64, value: &str) -> Message {
    Message::new(
        Partition::new("test".to_string(), 0),
        offset,
        Some(b"foo".to_vec()),
        Some(value.as_bytes().to_vec()),
        Some(1_700_000_000_000 + offset),
    )
}

/// Messages with consecutive offsets starting at 0, one per value.
pub fn make_messages(values: &[&str]) -> Vec<Message> {
    values
        .iter()
        .enumerate()
        .map(|(offset, value)| make_message(offset as i64, value))
        .collect()
}

// Finite source that ends once every queued message (or error) has been handed out
pub struct VecSource {
    items: VecDeque<Result<Message>>,
}

impl VecSource {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            items: messages.into_iter().map(Ok).collect(),
        }
    }

    /// Hand out `messages`, then fail with `error` instead of ending the stream.
    pub fn failing_after(messages: Vec<Message>, error: &str) -> Self {
        let mut source = Self::new(messages);
        source.items.push_back(Err(anyhow::anyhow!(error.to_string())));
        source
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn next(&mut self) -> Result<Option<Message>> {
        self.items.pop_front().transpose()
    }
}

// Source fed by the test through a channel; ends when the sender is dropped
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Message>>,
}

impl ChannelSource {
    pub fn channel() -> (mpsc::UnboundedSender<Result<Message>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<Message>> {
        self.rx.recv().await.transpose()
    }
}

/// Acknowledger that records what it acked and can be told to fail.
///
/// Failures are configured two ways: the first `fail_first` calls overall fail,
/// and each offset in `fail_offsets` fails its first `fail_times` attempts.
#[derive(Default)]
pub struct FlakyAcker {
    fail_first: u32,
    fail_offsets: Vec<i64>,
    fail_times: u32,
    attempts: AtomicU32,
    offset_attempts: Mutex<HashMap<i64, u32>>,
    acked: Mutex<Vec<Message>>,
}

impl FlakyAcker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn failing_offsets(fail_offsets: Vec<i64>, fail_times: u32) -> Self {
        Self {
            fail_offsets,
            fail_times,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> Vec<Message> {
        self.acked.lock().unwrap().clone()
    }

    pub fn acked_offsets(&self) -> Vec<i64> {
        self.acked.lock().unwrap().iter().map(|m| m.offset()).collect()
    }
}

#[async_trait]
impl Acknowledger for FlakyAcker {
    async fn ack(&self, record: &Message) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            anyhow::bail!("ack attempt {attempt} failed");
        }

        if self.fail_offsets.contains(&record.offset()) {
            let mut per_offset = self.offset_attempts.lock().unwrap();
            let tries = per_offset.entry(record.offset()).or_insert(0);
            *tries += 1;
            if *tries <= self.fail_times {
                anyhow::bail!("ack of offset {} failed", record.offset());
            }
        }

        self.acked.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// Counts close calls; can be told to fail
#[derive(Default)]
pub struct RecordingCloser {
    pub close_count: AtomicUsize,
    pub fail: bool,
}

impl RecordingCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn closes(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Disconnect for RecordingCloser {
    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("disconnect failed");
        }
        Ok(())
    }
}
