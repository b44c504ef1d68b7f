//! Broker implementation backed by process memory. Behaviourally
//! matches the AMQP implementation where it matters to the
//! coordination components: bounded prefetch, ack/nack semantics, and
//! redelivery of deliveries dropped without an ack.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use reporter_core::errors::Result;
use reporter_core::traits::{Acker, Broker, Delivery, MessageProperties};

#[derive(Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    props: MessageProperties,
}

#[derive(Default)]
struct QueueInner {
    messages: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
}

impl QueueInner {
    fn push_back(&self, message: QueuedMessage) {
        self.messages.lock().unwrap().push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: QueuedMessage) {
        self.messages.lock().unwrap().push_front(message);
        self.notify.notify_waiters();
    }

    async fn wait_pop(&self) -> QueuedMessage {
        loop {
            // Register for wakeup before checking, so a push between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            if let Some(message) = self.messages.lock().unwrap().pop_front() {
                return message;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, Arc<QueueInner>>,
    fanouts: HashMap<String, Vec<Weak<QueueInner>>>,
}

/// Fully in-process broker. Used by the test suites and by embedded
/// single-process deployments where AMQP is not available.
#[derive(Default)]
pub struct InMemoryBroker {
    inner: Mutex<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<QueueInner> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueInner::default()))
            .clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str, _durable: bool) -> Result<()> {
        self.queue(queue);
        Ok(())
    }

    // In-process queues die with the process; exclusivity has nothing
    // to enforce here.
    async fn declare_private_queue(&self, queue: &str) -> Result<()> {
        self.queue(queue);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.inner.lock().unwrap().queues.remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], props: MessageProperties) -> Result<()> {
        self.queue(queue).push_back(QueuedMessage {
            payload: payload.to_vec(),
            props,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let queue_inner = self.queue(queue);
        let permits = Arc::new(Semaphore::new(prefetch.max(1) as usize));
        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            loop {
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let message = tokio::select! {
                    message = queue_inner.wait_pop() => message,
                    _ = tx.closed() => break,
                };
                let delivery = Delivery {
                    payload: message.payload.clone(),
                    props: message.props.clone(),
                    acker: Box::new(MemoryAcker {
                        queue: queue_inner.clone(),
                        message: Some(message),
                        _permit: permit,
                    }),
                };
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(consumer_tag = %tag, "consumer stopped");
        });
        Ok(rx)
    }

    async fn declare_fanout(&self, exchange: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .fanouts
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    async fn publish_fanout(&self, exchange: &str, payload: &[u8]) -> Result<()> {
        let subscribers: Vec<Arc<QueueInner>> = {
            let mut inner = self.inner.lock().unwrap();
            let entries = inner.fanouts.entry(exchange.to_string()).or_default();
            entries.retain(|weak| weak.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        for subscriber in subscribers {
            subscriber.push_back(QueuedMessage {
                payload: payload.to_vec(),
                props: MessageProperties::default(),
            });
        }
        Ok(())
    }

    async fn subscribe_fanout(
        &self,
        exchange: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>> {
        let subscriber = Arc::new(QueueInner::default());
        self.inner
            .lock()
            .unwrap()
            .fanouts
            .entry(exchange.to_string())
            .or_default()
            .push(Arc::downgrade(&subscriber));

        let (tx, rx) = mpsc::channel(16);
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = subscriber.wait_pop() => message,
                    _ = tx.closed() => break,
                };
                let delivery = Delivery {
                    payload: message.payload,
                    props: message.props,
                    acker: Box::new(reporter_core::traits::NoopAcker),
                };
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(consumer_tag = %tag, "fanout subscriber stopped");
        });
        Ok(rx)
    }

    async fn queue_len(&self, queue: &str) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .queues
            .get(queue)
            .map(|q| q.messages.lock().unwrap().len() as u32)
            .unwrap_or(0))
    }

    async fn purge_queue(&self, queue: &str) -> Result<()> {
        if let Some(queue) = self.inner.lock().unwrap().queues.get(queue) {
            queue.messages.lock().unwrap().clear();
        }
        Ok(())
    }
}

/// Ack handle for an in-memory delivery. Dropping the handle without
/// acknowledging puts the message back at the head of its queue, which
/// is how redelivery after a consumer crash is modelled.
struct MemoryAcker {
    queue: Arc<QueueInner>,
    message: Option<QueuedMessage>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.message.take();
        Ok(())
    }

    async fn nack_requeue(mut self: Box<Self>) -> Result<()> {
        if let Some(message) = self.message.take() {
            self.queue.push_front(message);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.queue.push_front(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", true).await.unwrap();
        broker
            .publish("q", b"hello", MessageProperties::default())
            .await
            .unwrap();

        let mut rx = broker.consume("q", "t1", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, b"hello");
        delivery.acker.ack().await.unwrap();
        assert_eq!(broker.queue_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let broker = InMemoryBroker::new();
        broker
            .publish("q", b"retry-me", MessageProperties::default())
            .await
            .unwrap();

        let mut rx = broker.consume("q", "t1", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        delivery.acker.nack_requeue().await.unwrap();

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.payload, b"retry-me");
        redelivered.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_without_ack_redelivers() {
        let broker = InMemoryBroker::new();
        broker
            .publish("q", b"crash", MessageProperties::default())
            .await
            .unwrap();

        let mut rx = broker.consume("q", "t1", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        drop(delivery);

        let redelivered = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("redelivery")
            .unwrap();
        assert_eq!(redelivered.payload, b"crash");
        redelivered.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_prefetch_bounds_outstanding_deliveries() {
        let broker = InMemoryBroker::new();
        for i in 0..3u8 {
            broker
                .publish("q", &[i], MessageProperties::default())
                .await
                .unwrap();
        }

        let mut rx = broker.consume("q", "t1", 1).await.unwrap();
        let first = rx.recv().await.unwrap();

        // With prefetch 1 and the first delivery unacknowledged, the
        // second must not arrive yet.
        let second = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(second.is_err());

        first.acker.ack().await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("next delivery after ack")
            .unwrap();
        assert_eq!(second.payload, vec![1]);
        second.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_subscriber() {
        let broker = InMemoryBroker::new();
        broker.declare_fanout("beats").await.unwrap();
        let mut a = broker.subscribe_fanout("beats", "a").await.unwrap();
        let mut b = broker.subscribe_fanout("beats", "b").await.unwrap();

        broker.publish_fanout("beats", b"ping").await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, b"ping");
        assert_eq!(b.recv().await.unwrap().payload, b"ping");
    }

    #[tokio::test]
    async fn test_private_queue_carries_deliveries() {
        let broker = InMemoryBroker::new();
        broker.declare_private_queue("rpc.reply.abc").await.unwrap();
        broker
            .publish("rpc.reply.abc", b"reply", MessageProperties::default())
            .await
            .unwrap();

        let mut rx = broker.consume("rpc.reply.abc", "t1", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, b"reply");
        delivery.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_len_tolerates_unknown_queue() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.queue_len("never-declared").await.unwrap(), 0);
    }
}
