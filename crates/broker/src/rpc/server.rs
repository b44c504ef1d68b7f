use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use reporter_core::errors::Result;
use reporter_core::models::{RpcReply, RpcRequest};
use reporter_core::traits::{Broker, Delivery, MessageProperties};

use crate::rpc::stream::StreamServer;

/// Dispatch seam between the RPC server and the component that owns
/// the procedures. Unknown methods come back as a method-not-found
/// error, which the server puts on the wire unchanged.
#[async_trait]
pub trait RpcRouter: Send + Sync {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value>;
}

/// Serves RPC requests from one queue. Every request gets exactly one
/// reply; handler failures become error envelopes carrying only the
/// stable kind and message.
pub struct RpcServer {
    broker: Arc<dyn Broker>,
    queue: String,
    prefetch: u16,
    router: Arc<dyn RpcRouter>,
    streams: Option<Arc<StreamServer>>,
}

impl RpcServer {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        prefetch: u16,
        router: Arc<dyn RpcRouter>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            prefetch,
            router,
            streams: None,
        }
    }

    /// Enables stream-open requests on this server's queue.
    pub fn with_streams(mut self, streams: Arc<StreamServer>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Consumes the request queue until shutdown is signalled. Each
    /// request is handled on its own task so a slow handler does not
    /// head-of-line block the queue.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.broker.declare_queue(&self.queue, true).await?;
        let mut rx = self
            .broker
            .consume(&self.queue, "rpc-server", self.prefetch)
            .await?;
        info!(queue = %self.queue, "rpc server started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(queue = %self.queue, "rpc server stopping");
                    break;
                }
                delivery = rx.recv() => match delivery {
                    Some(delivery) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_delivery(delivery).await;
                        });
                    }
                    None => {
                        warn!(queue = %self.queue, "rpc consumer closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let request: RpcRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                // Nothing to reply to without a parseable envelope.
                warn!(queue = %self.queue, "discarding malformed request: {e}");
                let _ = delivery.acker.ack().await;
                return;
            }
        };
        let reply_to = delivery.props.reply_to.clone();

        let outcome = if request.stream {
            match &self.streams {
                Some(streams) => streams.open(&request.method, &request.args).await,
                None => Err(reporter_core::ReporterError::method_not_found(
                    &request.method,
                )),
            }
        } else {
            self.router.handle(&request.method, &request.args).await
        };

        let reply = match outcome {
            Ok(value) => RpcReply::ok(&request.correlation_id, value),
            Err(e) => {
                debug!(method = %request.method, "handler returned error: {e}");
                RpcReply::err(&request.correlation_id, &e)
            }
        };

        match reply_to {
            Some(reply_to) => {
                if let Err(e) = self.send_reply(&reply_to, &reply).await {
                    // The caller will observe this as a timeout.
                    error!(method = %request.method, "failed to publish reply: {e}");
                }
            }
            None => warn!(method = %request.method, "request has no reply-to, dropping reply"),
        }

        // Ack after the reply attempt either way; redelivering a
        // request whose handler already ran would execute it twice.
        if let Err(e) = delivery.acker.ack().await {
            warn!(queue = %self.queue, "failed to ack request: {e}");
        }
    }

    async fn send_reply(&self, reply_to: &str, reply: &RpcReply) -> Result<()> {
        let payload = serde_json::to_vec(reply)?;
        let props = MessageProperties::default().with_correlation_id(&reply.correlation_id);
        self.broker.publish(reply_to, &payload, props).await
    }
}
