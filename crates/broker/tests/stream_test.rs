//! Streaming RPC tests: ordered delivery, failure frames, strict
//! sequence checking and consumer-side cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use reporter_broker::rpc::stream::ReadStream;
use reporter_broker::{InMemoryBroker, RpcClient, RpcRouter, RpcServer, StreamServer, StreamSource};
use reporter_core::errors::{ReporterError, Result};
use reporter_core::models::StreamChunk;
use reporter_core::traits::{Broker, MessageProperties};

struct BlobSource {
    blobs: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl StreamSource for BlobSource {
    async fn open(
        &self,
        resource: &str,
        keys: &[Value],
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        if resource != "reports" {
            return Err(ReporterError::not_found(format!("resource {resource}")));
        }
        let key = keys
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ReporterError::internal("missing key"))?;
        match key {
            "broken" => {
                let frames: Vec<Result<Vec<u8>>> = vec![
                    Ok(vec![1, 2, 3]),
                    Err(ReporterError::internal("storage read failed")),
                ];
                Ok(futures::stream::iter(frames).boxed())
            }
            "endless" => Ok(futures::stream::repeat_with(|| Ok(vec![0u8; 64])).boxed()),
            _ => {
                let blob = self
                    .blobs
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ReporterError::not_found(format!("report {key}")))?;
                Ok(futures::stream::iter(vec![Ok(blob)]).boxed())
            }
        }
    }
}

struct NoMethods;

#[async_trait]
impl RpcRouter for NoMethods {
    async fn handle(&self, method: &str, _args: &[Value]) -> Result<Value> {
        Err(ReporterError::method_not_found(method))
    }
}

async fn start(
    blob: Vec<u8>,
    chunk_size: usize,
    window: u16,
) -> (Arc<dyn Broker>, RpcClient, broadcast::Sender<()>) {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let mut blobs = HashMap::new();
    blobs.insert("report-1".to_string(), blob);
    let streams = Arc::new(StreamServer::new(
        broker.clone(),
        Arc::new(BlobSource { blobs }),
        chunk_size,
        window,
    ));
    let server = Arc::new(
        RpcServer::new(broker.clone(), "rpc.stream", 16, Arc::new(NoMethods)).with_streams(streams),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.serve(shutdown_rx));
    let client = RpcClient::new(broker.clone(), "rpc.stream", Duration::from_secs(2))
        .await
        .unwrap();
    (broker, client, shutdown_tx)
}

#[tokio::test]
async fn test_stream_reassembles_in_order() {
    let blob: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let (_broker, client, _guard) = start(blob.clone(), 1024, 8).await;

    let mut stream = client
        .open_stream("reports", vec![json!("report-1")], 4)
        .await
        .unwrap();

    let mut assembled = Vec::new();
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        assert!(chunk.len() <= 1024);
        assembled.extend_from_slice(&chunk);
    }
    assert_eq!(assembled, blob);

    // Past the terminal marker the stream stays finished.
    assert!(stream.next_chunk().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_key_fails_before_any_queue_exists() {
    let (_broker, client, _guard) = start(vec![1], 1024, 8).await;
    match client
        .open_stream("reports", vec![json!("report-404")], 4)
        .await
    {
        Err(ReporterError::NotFound(what)) => assert!(what.contains("report-404")),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mid_stream_failure_surfaces_as_error_frame() {
    let (_broker, client, _guard) = start(vec![1], 1024, 8).await;
    let mut stream = client
        .open_stream("reports", vec![json!("broken")], 4)
        .await
        .unwrap();

    assert_eq!(stream.next_chunk().await.unwrap(), Some(vec![1, 2, 3]));
    match stream.next_chunk().await {
        Err(ReporterError::Remote { kind, message }) => {
            assert_eq!(kind, "internal");
            assert!(message.contains("storage read failed"));
        }
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sequence_gap_rejected() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.declare_queue("chunks", false).await.unwrap();
    broker.declare_queue("abort", false).await.unwrap();

    for frame in [
        StreamChunk::data("s1", 0, vec![1]),
        StreamChunk::data("s1", 2, vec![3]),
    ] {
        broker
            .publish(
                "chunks",
                &serde_json::to_vec(&frame).unwrap(),
                MessageProperties::default(),
            )
            .await
            .unwrap();
    }

    let rx = broker.consume("chunks", "t", 4).await.unwrap();
    let mut stream = ReadStream::attach(broker.clone(), "s1", "chunks", "abort", rx);
    assert_eq!(stream.next_chunk().await.unwrap(), Some(vec![1]));
    match stream.next_chunk().await {
        Err(ReporterError::OutOfOrder {
            expected, got, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(got, 2);
        }
        other => panic!("expected OutOfOrder, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stalled_reader_bounds_chunk_queue() {
    let (broker, client, _guard) = start(vec![1], 64, 4).await;
    let mut stream = client
        .open_stream("reports", vec![json!("endless")], 2)
        .await
        .unwrap();

    // Read nothing and let the pump run as far ahead as it will.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let chunk_queue = format!("reporting.stream.{}.chunks", stream.stream_id());
    let depth = broker.queue_len(&chunk_queue).await.unwrap();
    assert!(
        depth <= 4,
        "producer ran ahead of the stalled reader: {depth} frames queued"
    );

    // Draining frames hands the producer credit again.
    for _ in 0..8 {
        assert!(stream.next_chunk().await.unwrap().is_some());
    }
    stream.cancel().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_frame_discarded_not_redelivered() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.declare_queue("chunks", false).await.unwrap();
    broker.declare_queue("abort", false).await.unwrap();

    broker
        .publish("chunks", b"not a frame", MessageProperties::default())
        .await
        .unwrap();
    let good = StreamChunk::data("s1", 0, vec![7]);
    broker
        .publish(
            "chunks",
            &serde_json::to_vec(&good).unwrap(),
            MessageProperties::default(),
        )
        .await
        .unwrap();

    let rx = broker.consume("chunks", "t", 4).await.unwrap();
    let mut stream = ReadStream::attach(broker.clone(), "s1", "chunks", "abort", rx);
    match stream.next_chunk().await {
        Err(ReporterError::Serialization(_)) => {}
        other => panic!("expected Serialization, got {other:?}"),
    }
    // The bad frame was dropped, not requeued at the head.
    assert_eq!(stream.next_chunk().await.unwrap(), Some(vec![7]));
}

#[tokio::test]
async fn test_cancel_stops_producer_and_cleans_up() {
    let (broker, client, _guard) = start(vec![1], 64, 4).await;
    let mut stream = client
        .open_stream("reports", vec![json!("endless")], 2)
        .await
        .unwrap();

    stream.next_chunk().await.unwrap();
    stream.next_chunk().await.unwrap();
    stream.cancel().await.unwrap();

    // The pump drops both stream queues once it sees the abort.
    let chunk_queue = format!("reporting.stream.{}.chunks", stream.stream_id());
    let mut drained = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if broker.queue_len(&chunk_queue).await.unwrap() == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "producer kept publishing after cancel");
}
