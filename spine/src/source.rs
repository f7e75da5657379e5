use async_trait::async_trait;

use crate::message::Message;

/// An ordered supply of records, e.g. one Kafka topic subscription.
#[async_trait]
pub trait MessageSource: Send {
    /// Next record in delivery order. `Ok(None)` marks the end of the stream.
    async fn next(&mut self) -> anyhow::Result<Option<Message>>;
}

/// Marks a record as processed, e.g. by committing its offset. May fail transiently.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, record: &Message) -> anyhow::Result<()>;
}

/// Graceful disconnect of the connection behind a source.
///
/// Implementations must be idempotent and only resolve once the underlying
/// connection has confirmed it is gone.
#[async_trait]
pub trait Disconnect: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<A> Acknowledger for std::sync::Arc<A>
where
    A: Acknowledger + ?Sized,
{
    async fn ack(&self, record: &Message) -> anyhow::Result<()> {
        (**self).ack(record).await
    }
}
