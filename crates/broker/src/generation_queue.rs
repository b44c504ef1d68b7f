//! Producer side of the durable generation job queue.

use std::sync::Arc;

use tracing::{debug, info};

use reporter_core::config::GenerationQueueConfig;
use reporter_core::errors::Result;
use reporter_core::models::GenerationRequest;
use reporter_core::traits::{Broker, Delivery, MessageProperties};
use tokio::sync::mpsc;

/// Handle on the durable generation queue. Enqueue resolves only once
/// the broker has accepted the message, so a failed publish surfaces
/// to the caller instead of silently dropping a job.
pub struct GenerationQueue {
    broker: Arc<dyn Broker>,
    config: GenerationQueueConfig,
}

impl GenerationQueue {
    pub async fn new(broker: Arc<dyn Broker>, config: GenerationQueueConfig) -> Result<Self> {
        broker.declare_queue(&config.queue, true).await?;
        info!(queue = %config.queue, "generation queue ready");
        Ok(Self { broker, config })
    }

    pub async fn enqueue(&self, request: &GenerationRequest) -> Result<()> {
        request.validate()?;
        let payload = serde_json::to_vec(request)?;
        self.broker
            .publish(&self.config.queue, &payload, MessageProperties::default())
            .await?;
        debug!(generation_id = %request.id, task_id = %request.task_id, "generation enqueued");
        Ok(())
    }

    /// Starts a consumer with the configured prefetch window (1 by
    /// default, so a worker holds at most one unacknowledged job).
    pub async fn consume(&self, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        self.broker
            .consume(&self.config.queue, consumer_tag, self.config.prefetch)
            .await
    }

    pub async fn len(&self) -> Result<u32> {
        self.broker.queue_len(&self.config.queue).await
    }

    pub async fn purge(&self) -> Result<()> {
        self.broker.purge_queue(&self.config.queue).await
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue
    }
}
