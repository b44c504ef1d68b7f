use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use reporter_core::errors::{ReporterError, Result};
use reporter_core::models::{RpcReply, RpcRequest};
use reporter_core::traits::{Broker, MessageProperties};

use crate::rpc::stream::ReadStream;

/// Client side of the RPC framework. One instance owns one private
/// reply queue and demultiplexes all in-flight calls over it by
/// correlation id.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    server_queue: String,
    reply_queue: String,
    call_timeout: Duration,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<RpcReply>>>>,
}

impl RpcClient {
    pub async fn new(
        broker: Arc<dyn Broker>,
        server_queue: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let server_queue = server_queue.into();
        let reply_queue = format!("{server_queue}.reply.{}", Uuid::new_v4());
        broker.declare_private_queue(&reply_queue).await?;
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<RpcReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut rx = broker.consume(&reply_queue, "rpc-replies", 16).await?;
        let demux_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let reply: RpcReply = match serde_json::from_slice(&delivery.payload) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("discarding malformed reply: {e}");
                        let _ = delivery.acker.ack().await;
                        continue;
                    }
                };
                let _ = delivery.acker.ack().await;
                let waiter = demux_pending.lock().await.remove(&reply.correlation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    // Replies to calls that already timed out are
                    // dropped without side effects.
                    None => debug!(
                        correlation_id = %reply.correlation_id,
                        "dropping orphan reply"
                    ),
                }
            }
            // Consumer gone: fail whatever is still waiting.
            demux_pending.lock().await.clear();
        });

        Ok(Self {
            broker,
            server_queue,
            reply_queue,
            call_timeout,
            pending,
        })
    }

    /// Performs one remote call and waits for its reply or the
    /// configured timeout, whichever comes first. A late reply after a
    /// timeout is discarded by the demultiplexer.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let request = RpcRequest::new(method, args);
        self.dispatch(request).await?.into_result()
    }

    /// Opens a read stream. The negotiation rides the plain call path;
    /// the reply names the per-stream queues this end then consumes.
    pub async fn open_stream(
        &self,
        resource: &str,
        keys: Vec<Value>,
        prefetch: u16,
    ) -> Result<ReadStream> {
        let request = RpcRequest::stream_open(resource, keys);
        let grant = self.dispatch(request).await?.into_result()?;

        let stream_id = grant
            .get("stream_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ReporterError::internal("stream grant missing stream_id"))?
            .to_string();
        let chunk_queue = grant
            .get("chunk_queue")
            .and_then(Value::as_str)
            .ok_or_else(|| ReporterError::internal("stream grant missing chunk_queue"))?
            .to_string();
        let abort_queue = grant
            .get("abort_queue")
            .and_then(Value::as_str)
            .ok_or_else(|| ReporterError::internal("stream grant missing abort_queue"))?
            .to_string();

        let rx = self
            .broker
            .consume(&chunk_queue, "stream-chunks", prefetch)
            .await?;
        Ok(ReadStream::attach(
            self.broker.clone(),
            stream_id,
            chunk_queue,
            abort_queue,
            rx,
        ))
    }

    async fn dispatch(&self, request: RpcRequest) -> Result<RpcReply> {
        let correlation_id = request.correlation_id.clone();
        let method = request.method.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id.clone(), tx);

        let payload = serde_json::to_vec(&request)?;
        let props = MessageProperties::default()
            .with_correlation_id(&correlation_id)
            .with_reply_to(&self.reply_queue);
        if let Err(e) = self.broker.publish(&self.server_queue, &payload, props).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ReporterError::connection(
                "reply channel closed before the call completed",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(ReporterError::RpcTimeout {
                    method,
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }
}
