use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Offset, TopicPartitionList,
};
use spine::{Acknowledger, Disconnect, Message, MessageSource, Partition};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Consumer subscribed to exactly one topic, usable as a pipeline's source,
/// acknowledger and close handle at once. Clones share the same connection.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
    closed: CancellationToken,
}

pub fn client_config(common_config: &KafkaConfig, consumer_config: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &common_config.kafka_hosts)
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set("client.id", &consumer_config.kafka_consumer_group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set(
            "session.timeout.ms",
            consumer_config.kafka_session_timeout_ms.to_string(),
        )
        .set(
            "retry.backoff.ms",
            common_config.kafka_retry_backoff_ms.to_string(),
        )
        .set("socket.keepalive.enable", "true");

    if common_config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = client_config(&common_config, &consumer_config).create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
            closed: CancellationToken::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

/// Copy a broker message into an owned [`Message`].
pub fn to_message<M: rdkafka::Message>(message: &M) -> Message {
    Message::new(
        Partition::new(message.topic().to_string(), message.partition()),
        message.offset(),
        message.key().map(<[u8]>::to_vec),
        message.payload().map(<[u8]>::to_vec),
        message.timestamp().to_millis(),
    )
}

#[async_trait]
impl MessageSource for SingleTopicConsumer {
    /// Ends the stream once the consumer has been closed.
    async fn next(&mut self) -> anyhow::Result<Option<Message>> {
        if self.inner.closed.is_cancelled() {
            return Ok(None);
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => Ok(None),
            received = self.inner.consumer.recv() => {
                let message = received.context("failed to receive from kafka")?;
                Ok(Some(to_message(&message)))
            }
        }
    }
}

#[async_trait]
impl Acknowledger for SingleTopicConsumer {
    /// Commits the offset after `record`, i.e. the next one to be consumed.
    async fn ack(&self, record: &Message) -> anyhow::Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                record.topic(),
                record.partition_number(),
                Offset::Offset(record.offset() + 1),
            )
            .context("failed to build offset list")?;

        self.inner
            .consumer
            .commit(&offsets, CommitMode::Async)
            .with_context(|| {
                format!(
                    "failed to commit offset {} on {}:{}",
                    record.offset() + 1,
                    record.topic(),
                    record.partition_number()
                )
            })?;

        debug!(
            topic = record.topic(),
            partition = record.partition_number(),
            offset = record.offset(),
            "committed offset"
        );
        Ok(())
    }
}

#[async_trait]
impl Disconnect for SingleTopicConsumer {
    /// Stops `next` and leaves the group. Only acknowledged offsets are ever
    /// committed, so the group resumes after the last acked record. Calling it
    /// again is a no-op.
    async fn close(&self) -> anyhow::Result<()> {
        if self.inner.closed.is_cancelled() {
            return Ok(());
        }
        self.inner.closed.cancel();
        info!(topic = self.inner.topic.as_str(), "closing kafka consumer");

        self.inner.consumer.unsubscribe();
        info!(topic = self.inner.topic.as_str(), "kafka consumer disconnected");
        Ok(())
    }
}
