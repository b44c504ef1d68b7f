use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;

/// AMQP-style properties attached to a published message. The reply-to
/// convention of the RPC framework rides on these.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Per-delivery acknowledgement handle. A delivery dropped without an
/// ack is redelivered by the broker (at-least-once).
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack_requeue(self: Box<Self>) -> Result<()>;
}

/// One consumed message plus its acknowledgement handle.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub props: MessageProperties,
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("props", &self.props)
            .finish()
    }
}

/// Minimal queue/fan-out surface every coordination component builds
/// on. One implementation speaks AMQP, another runs fully in memory
/// for tests and embedded deployments.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()>;

    /// Declares a queue owned by this connection alone: exclusive to
    /// it and removed by the broker when the connection goes away.
    /// Reply queues use this so a restarted client leaves no queue
    /// behind.
    async fn declare_private_queue(&self, queue: &str) -> Result<()>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Publishes one message. For durable queues the call resolves only
    /// once the broker has confirmed the publish, so failures surface
    /// to the caller.
    async fn publish(&self, queue: &str, payload: &[u8], props: MessageProperties) -> Result<()>;

    /// Starts a consumer with a bounded prefetch window. At most
    /// `prefetch` deliveries are outstanding (unacknowledged) at a
    /// time; the receiver closing cancels the consumer.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>>;

    async fn declare_fanout(&self, exchange: &str) -> Result<()>;

    /// Broadcast to every current subscriber of the exchange.
    async fn publish_fanout(&self, exchange: &str, payload: &[u8]) -> Result<()>;

    /// Subscribes to a fan-out exchange on a private queue.
    async fn subscribe_fanout(
        &self,
        exchange: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>>;

    /// Number of messages waiting in the queue; 0 for a queue that does
    /// not exist.
    async fn queue_len(&self, queue: &str) -> Result<u32>;

    async fn purge_queue(&self, queue: &str) -> Result<()>;
}

/// Acker for contexts where acknowledgement is meaningless (e.g. test
/// fixtures building deliveries by hand).
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }
    async fn nack_requeue(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
