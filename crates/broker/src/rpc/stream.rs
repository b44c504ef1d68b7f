use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use reporter_core::errors::{ReporterError, Result};
use reporter_core::models::{StreamAbort, StreamChunk};
use reporter_core::traits::{Broker, Delivery, MessageProperties};

/// Produces the bytes of one streamable resource. The framework does
/// the queue plumbing; implementations only resolve keys to bytes.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, resource: &str, keys: &[Value]) -> Result<BoxStream<'static, Result<Vec<u8>>>>;
}

/// Splits a payload into frames of at most `size` bytes, preserving
/// order. An empty payload yields no frames.
pub fn chunks_of(bytes: &[u8], size: usize) -> Vec<Vec<u8>> {
    bytes.chunks(size.max(1)).map(<[u8]>::to_vec).collect()
}

/// Server half of the streaming extension. A granted stream gets two
/// private queues: one carrying chunks downstream and one carrying the
/// consumer's abort signal upstream.
pub struct StreamServer {
    broker: Arc<dyn Broker>,
    source: Arc<dyn StreamSource>,
    chunk_size: usize,
    window: u16,
}

impl StreamServer {
    /// `window` caps how many unread frames may sit in a stream's
    /// chunk queue; the pump pauses at the cap until the consumer
    /// drains frames.
    pub fn new(
        broker: Arc<dyn Broker>,
        source: Arc<dyn StreamSource>,
        chunk_size: usize,
        window: u16,
    ) -> Self {
        Self {
            broker,
            source,
            chunk_size,
            window: window.max(1),
        }
    }

    /// Handles a stream-open request. Resolution errors surface in the
    /// RPC reply before any queue exists; past this point failures
    /// travel as in-band error frames.
    pub async fn open(&self, resource: &str, keys: &[Value]) -> Result<Value> {
        let source = self.source.open(resource, keys).await?;

        let stream_id = Uuid::new_v4().to_string();
        let chunk_queue = format!("reporting.stream.{stream_id}.chunks");
        let abort_queue = format!("reporting.stream.{stream_id}.abort");
        self.broker.declare_queue(&chunk_queue, false).await?;
        self.broker.declare_queue(&abort_queue, false).await?;
        let abort_rx = self.broker.consume(&abort_queue, "stream-abort", 1).await?;

        let pump = StreamPump {
            broker: self.broker.clone(),
            stream_id: stream_id.clone(),
            chunk_queue: chunk_queue.clone(),
            abort_queue: abort_queue.clone(),
            chunk_size: self.chunk_size,
            window: self.window,
        };
        tokio::spawn(pump.run(source, abort_rx));

        Ok(json!({
            "stream_id": stream_id,
            "chunk_queue": chunk_queue,
            "abort_queue": abort_queue,
        }))
    }
}

struct StreamPump {
    broker: Arc<dyn Broker>,
    stream_id: String,
    chunk_queue: String,
    abort_queue: String,
    chunk_size: usize,
    window: u16,
}

enum PumpStep {
    Continue,
    Aborted,
    Failed,
}

impl StreamPump {
    async fn run(
        self,
        mut source: BoxStream<'static, Result<Vec<u8>>>,
        mut abort_rx: mpsc::Receiver<Delivery>,
    ) {
        let mut sequence: u64 = 0;
        let mut aborted = false;
        loop {
            tokio::select! {
                abort = abort_rx.recv() => {
                    Self::ack_abort(abort).await;
                    info!(stream_id = %self.stream_id, "stream aborted by consumer");
                    aborted = true;
                    break;
                }
                item = source.next() => match item {
                    Some(Ok(bytes)) => {
                        match self.publish_data(&bytes, &mut sequence, &mut abort_rx).await {
                            PumpStep::Continue => {}
                            PumpStep::Aborted => {
                                info!(stream_id = %self.stream_id, "stream aborted by consumer");
                                aborted = true;
                                break;
                            }
                            PumpStep::Failed => {
                                aborted = true;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(stream_id = %self.stream_id, "source failed mid-stream: {e}");
                        let frame = StreamChunk::error(&self.stream_id, &e);
                        let _ = self.publish_frame(&frame).await;
                        break;
                    }
                    None => {
                        let frame = StreamChunk::terminal(&self.stream_id, sequence);
                        if let Err(e) = self.publish_frame(&frame).await {
                            warn!(stream_id = %self.stream_id, "failed to publish terminal frame: {e}");
                        }
                        break;
                    }
                },
            }
        }
        if aborted {
            // The consumer is gone; drop whatever it never read.
            let _ = self.broker.delete_queue(&self.chunk_queue).await;
        }
        let _ = self.broker.delete_queue(&self.abort_queue).await;
        debug!(stream_id = %self.stream_id, frames = sequence, "stream pump finished");
    }

    async fn publish_data(
        &self,
        bytes: &[u8],
        sequence: &mut u64,
        abort_rx: &mut mpsc::Receiver<Delivery>,
    ) -> PumpStep {
        for part in chunks_of(bytes, self.chunk_size) {
            match self.wait_for_credit(abort_rx).await {
                PumpStep::Continue => {}
                step => return step,
            }
            let frame = StreamChunk::data(&self.stream_id, *sequence, part);
            if let Err(e) = self.publish_frame(&frame).await {
                warn!(stream_id = %self.stream_id, "failed to publish chunk: {e}");
                return PumpStep::Failed;
            }
            *sequence += 1;
        }
        PumpStep::Continue
    }

    /// Holds the pump while the chunk queue sits at the window cap.
    /// Credit is the consumer draining frames; an abort arriving during
    /// the wait ends the stream.
    async fn wait_for_credit(&self, abort_rx: &mut mpsc::Receiver<Delivery>) -> PumpStep {
        loop {
            match self.broker.queue_len(&self.chunk_queue).await {
                Ok(depth) if depth < u32::from(self.window) => return PumpStep::Continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(stream_id = %self.stream_id, "lost sight of the chunk queue: {e}");
                    return PumpStep::Failed;
                }
            }
            tokio::select! {
                abort = abort_rx.recv() => {
                    Self::ack_abort(abort).await;
                    return PumpStep::Aborted;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }
    }

    async fn ack_abort(abort: Option<Delivery>) {
        if let Some(delivery) = abort {
            let _ = delivery.acker.ack().await;
        }
    }

    async fn publish_frame(&self, frame: &StreamChunk) -> Result<()> {
        let payload = serde_json::to_vec(frame)?;
        self.broker
            .publish(&self.chunk_queue, &payload, MessageProperties::default())
            .await
    }
}

/// Consumer handle on an open stream. Frames are surfaced in strict
/// sequence order; any gap or repetition fails the read immediately
/// instead of yielding silently corrupt bytes.
pub struct ReadStream {
    broker: Arc<dyn Broker>,
    stream_id: String,
    chunk_queue: String,
    abort_queue: String,
    rx: mpsc::Receiver<Delivery>,
    expected: u64,
    finished: bool,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("stream_id", &self.stream_id)
            .field("chunk_queue", &self.chunk_queue)
            .field("abort_queue", &self.abort_queue)
            .field("expected", &self.expected)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ReadStream {
    /// Binds a handle onto already-negotiated stream queues.
    pub fn attach(
        broker: Arc<dyn Broker>,
        stream_id: impl Into<String>,
        chunk_queue: impl Into<String>,
        abort_queue: impl Into<String>,
        rx: mpsc::Receiver<Delivery>,
    ) -> Self {
        Self {
            broker,
            stream_id: stream_id.into(),
            chunk_queue: chunk_queue.into(),
            abort_queue: abort_queue.into(),
            rx,
            expected: 0,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next data frame, `None` at the terminal marker. Taking a frame
    /// drains the chunk queue, which is what grants the producer credit
    /// for further frames; a stalled reader stalls the producer instead
    /// of buffering unboundedly.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        let Some(delivery) = self.rx.recv().await else {
            self.finished = true;
            return Err(ReporterError::channel(format!(
                "stream {} closed before its terminal frame",
                self.stream_id
            )));
        };
        let frame: StreamChunk = match serde_json::from_slice(&delivery.payload) {
            Ok(frame) => frame,
            Err(e) => {
                // Ack the undecodable frame; requeued it would only
                // come straight back.
                warn!(stream_id = %self.stream_id, "discarding undecodable frame: {e}");
                let _ = delivery.acker.ack().await;
                return Err(e.into());
            }
        };
        delivery.acker.ack().await?;

        if let Some(body) = frame.error {
            self.finished = true;
            return Err(ReporterError::from_wire(&body.kind, &body.message));
        }
        if frame.terminal {
            self.finished = true;
            if frame.sequence != self.expected {
                return Err(ReporterError::OutOfOrder {
                    stream_id: self.stream_id.clone(),
                    expected: self.expected,
                    got: frame.sequence,
                });
            }
            let _ = self.broker.delete_queue(&self.chunk_queue).await;
            return Ok(None);
        }
        if frame.sequence != self.expected {
            self.finished = true;
            return Err(ReporterError::OutOfOrder {
                stream_id: self.stream_id.clone(),
                expected: self.expected,
                got: frame.sequence,
            });
        }
        self.expected += 1;
        Ok(frame.data)
    }

    /// Tells the producer to stop. Idempotent; a finished stream is a
    /// no-op.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let abort = StreamAbort::new(&self.stream_id);
        let payload = serde_json::to_vec(&abort)?;
        self.broker
            .publish(&self.abort_queue, &payload, MessageProperties::default())
            .await
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Best effort: let the producer stop instead of filling a queue
        // nobody reads.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let broker = self.broker.clone();
            let abort_queue = self.abort_queue.clone();
            let stream_id = self.stream_id.clone();
            handle.spawn(async move {
                let abort = StreamAbort::new(&stream_id);
                if let Ok(payload) = serde_json::to_vec(&abort) {
                    let _ = broker
                        .publish(&abort_queue, &payload, MessageProperties::default())
                        .await;
                }
            });
        }
    }
}
