use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use reporter_core::errors::{ReporterError, Result};
use reporter_core::traits::{Acker, Broker, Delivery, MessageProperties};

use crate::connection::ConnectionManager;

/// AMQP implementation of the broker seam. Each instance owns one
/// channel lent by the connection manager; components construct their
/// own instance instead of sharing channels.
pub struct AmqpBroker {
    channel: Arc<Mutex<Channel>>,
}

impl AmqpBroker {
    pub async fn new(manager: &ConnectionManager) -> Result<Self> {
        let channel = manager.create_channel().await?;
        // Publisher confirms so enqueue failures surface to callers.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ReporterError::channel(format!("failed to enable confirms: {e}")))?;
        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn declare(&self, channel: &Channel, queue: &str, durable: bool) -> Result<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ReporterError::queue(format!("failed to declare queue {queue}: {e}")))?;
        debug!(queue, durable, "queue declared");
        Ok(())
    }

    async fn start_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let channel = self.channel.lock().await;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ReporterError::channel(format!("failed to set prefetch: {e}")))?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                ReporterError::queue(format!("failed to consume from queue {queue}: {e}"))
            })?;

        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);
        let cancel_channel = channel.clone();
        let tag = consumer_tag.to_string();
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            let props = MessageProperties {
                                correlation_id: delivery
                                    .properties
                                    .correlation_id()
                                    .as_ref()
                                    .map(|s| s.to_string()),
                                reply_to: delivery
                                    .properties
                                    .reply_to()
                                    .as_ref()
                                    .map(|s| s.to_string()),
                            };
                            let out = Delivery {
                                payload: delivery.data.clone(),
                                props,
                                acker: Box::new(AmqpAcker {
                                    acker: delivery.acker,
                                }),
                            };
                            if tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(queue = %queue_name, "consumer error: {e}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = cancel_channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await;
        });
        Ok(rx)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()> {
        let channel = self.channel.lock().await;
        self.declare(&channel, queue, durable).await
    }

    async fn declare_private_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        // Exclusive and auto-delete: the broker drops the queue with
        // the declaring connection, so client restarts leave nothing
        // behind.
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                ReporterError::queue(format!("failed to declare private queue {queue}: {e}"))
            })?;
        debug!(queue, "private queue declared");
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| ReporterError::queue(format!("failed to delete queue {queue}: {e}")))?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], props: MessageProperties) -> Result<()> {
        let channel = self.channel.lock().await;
        let mut properties = BasicProperties::default().with_delivery_mode(2);
        if let Some(id) = props.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }
        if let Some(reply_to) = props.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| ReporterError::queue(format!("failed to publish to {queue}: {e}")))?
            .await
            .map_err(|e| ReporterError::queue(format!("publish confirm failed: {e}")))?;
        if let Confirmation::Nack(_) = confirm {
            return Err(ReporterError::queue(format!(
                "broker rejected publish to {queue}"
            )));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>> {
        self.start_consumer(queue, consumer_tag, prefetch).await
    }

    async fn declare_fanout(&self, exchange: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                ReporterError::queue(format!("failed to declare exchange {exchange}: {e}"))
            })?;
        Ok(())
    }

    async fn publish_fanout(&self, exchange: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| ReporterError::queue(format!("failed to broadcast on {exchange}: {e}")))?
            .await
            .map_err(|e| ReporterError::queue(format!("broadcast confirm failed: {e}")))?;
        Ok(())
    }

    async fn subscribe_fanout(
        &self,
        exchange: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let queue_name = {
            let channel = self.channel.lock().await;
            // Server-named private queue, dropped with the subscriber.
            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    ReporterError::queue(format!("failed to declare subscriber queue: {e}"))
                })?;
            channel
                .queue_bind(
                    queue.name().as_str(),
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ReporterError::queue(format!("failed to bind to {exchange}: {e}")))?;
            queue.name().as_str().to_string()
        };
        self.start_consumer(&queue_name, consumer_tag, 16).await
    }

    async fn queue_len(&self, queue: &str) -> Result<u32> {
        let channel = self.channel.lock().await;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        match declared {
            Ok(info) => Ok(info.message_count()),
            Err(e) => {
                let message = e.to_string();
                if message.contains("NOT_FOUND") || message.contains("404") {
                    debug!(queue, "queue does not exist, reporting empty");
                    Ok(0)
                } else {
                    Err(ReporterError::queue(format!(
                        "failed to inspect queue {queue}: {e}"
                    )))
                }
            }
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| ReporterError::queue(format!("failed to purge queue {queue}: {e}")))?;
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        // lapin reports whether the ack was sent; a no-op on a dead
        // channel is not an error here.
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| ReporterError::queue(format!("failed to ack delivery: {e}")))
    }

    async fn nack_requeue(self: Box<Self>) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| ReporterError::queue(format!("failed to nack delivery: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the trait wrapper over a detached lapin acker; the
    // real channel path needs a running broker.
    #[tokio::test]
    async fn test_acker_wrapper_resolves_to_unit() {
        let acker: Box<dyn Acker> = Box::new(AmqpAcker {
            acker: lapin::acker::Acker::mock(),
        });
        acker.ack().await.unwrap();

        let acker: Box<dyn Acker> = Box::new(AmqpAcker {
            acker: lapin::acker::Acker::mock(),
        });
        acker.nack_requeue().await.unwrap();
    }
}
