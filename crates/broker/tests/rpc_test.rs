//! End-to-end RPC framework tests over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use reporter_broker::{InMemoryBroker, RpcClient, RpcRouter, RpcServer};
use reporter_core::errors::{ReporterError, Result};
use reporter_core::traits::Broker;

struct TestRouter;

#[async_trait]
impl RpcRouter for TestRouter {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "echo" => Ok(args.first().cloned().unwrap_or(Value::Null)),
            "sum" => {
                let total: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(total))
            }
            "sleepy" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("late"))
            }
            "boom" => Err(ReporterError::internal("handler exploded")),
            other => Err(ReporterError::method_not_found(other)),
        }
    }
}

async fn start_server(broker: Arc<dyn Broker>, queue: &str) -> broadcast::Sender<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = Arc::new(RpcServer::new(broker, queue, 16, Arc::new(TestRouter)));
    tokio::spawn(server.serve(shutdown_rx));
    shutdown_tx
}

#[tokio::test]
async fn test_call_round_trip() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let _shutdown = start_server(broker.clone(), "rpc.test").await;
    let client = RpcClient::new(broker, "rpc.test", Duration::from_secs(2))
        .await
        .unwrap();

    let result = client.call("echo", vec![json!({"x": 1})]).await.unwrap();
    assert_eq!(result, json!({"x": 1}));

    let result = client.call("sum", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(result, json!(5));
}

#[tokio::test]
async fn test_unknown_method_is_typed_error() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let _shutdown = start_server(broker.clone(), "rpc.test").await;
    let client = RpcClient::new(broker, "rpc.test", Duration::from_secs(2))
        .await
        .unwrap();

    match client.call("definitelyNotAMethod", vec![]).await {
        Err(ReporterError::MethodNotFound { .. }) => {}
        other => panic!("expected MethodNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handler_error_crosses_wire_without_internals() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let _shutdown = start_server(broker.clone(), "rpc.test").await;
    let client = RpcClient::new(broker, "rpc.test", Duration::from_secs(2))
        .await
        .unwrap();

    match client.call("boom", vec![]).await {
        Err(ReporterError::Remote { kind, message }) => {
            assert_eq!(kind, "internal");
            assert!(message.contains("handler exploded"));
        }
        other => panic!("expected Remote, got {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_then_orphan_reply_is_dropped() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let _shutdown = start_server(broker.clone(), "rpc.test").await;
    let client = RpcClient::new(broker.clone(), "rpc.test", Duration::from_millis(100))
        .await
        .unwrap();

    match client.call("sleepy", vec![]).await {
        Err(ReporterError::RpcTimeout { method, .. }) => assert_eq!(method, "sleepy"),
        other => panic!("expected RpcTimeout, got {other:?}"),
    }

    // Let the late reply arrive and be discarded, then prove the same
    // demultiplexer does not mis-route the orphan to a later call.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let patient = RpcClient::new(broker, "rpc.test", Duration::from_secs(2))
        .await
        .unwrap();
    let result = patient
        .call("echo", vec![json!("still alive")])
        .await
        .unwrap();
    assert_eq!(result, json!("still alive"));

    // The timed-out client still works for fresh calls.
    let result = client.call("echo", vec![json!(1)]).await.unwrap();
    assert_eq!(result, json!(1));
}

#[tokio::test]
async fn test_concurrent_calls_demultiplex_by_correlation_id() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let _shutdown = start_server(broker.clone(), "rpc.test").await;
    let client = Arc::new(
        RpcClient::new(broker, "rpc.test", Duration::from_secs(2))
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let result = client.call("echo", vec![json!(i)]).await.unwrap();
            assert_eq!(result, json!(i));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}
