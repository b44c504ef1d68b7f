//! Cron control procedures exercised end to end over RPC.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use reporter_broker::{GenerationQueue, InMemoryBroker, RpcClient, RpcServer};
use reporter_core::config::{GenerationQueueConfig, SchedulerConfig, TimerConfig};
use reporter_core::errors::ReporterError;
use reporter_core::memory_store::MemoryTaskStore;
use reporter_core::models::Task;
use reporter_core::traits::{Broker, TaskStore};
use reporter_dispatcher::{CronControl, CronScheduler};

async fn start() -> (RpcClient, Arc<GenerationQueue>, broadcast::Sender<()>) {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let queue = Arc::new(
        GenerationQueue::new(broker.clone(), GenerationQueueConfig::default())
            .await
            .unwrap(),
    );
    let store = Arc::new(MemoryTaskStore::new());
    store
        .upsert(Task::new(
            "task-1",
            "daily",
            vec!["ops@example.org".to_string()],
        ))
        .await
        .unwrap();

    let config = SchedulerConfig {
        enabled: true,
        timers: vec![TimerConfig {
            name: "daily-generation".to_string(),
            interval_seconds: 3600,
        }],
    };
    let scheduler = Arc::new(CronScheduler::new(&config, queue.clone(), store));
    let control = Arc::new(CronControl::new(scheduler));

    let server = Arc::new(RpcServer::new(broker.clone(), "rpc.scheduler", 16, control));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.serve(shutdown_rx));

    let client = RpcClient::new(broker, "rpc.scheduler", Duration::from_secs(2))
        .await
        .unwrap();
    (client, queue, shutdown_tx)
}

#[tokio::test]
async fn test_get_stop_start_over_rpc() {
    let (client, _queue, _guard) = start().await;

    let crons = client.call("getAllCrons", vec![]).await.unwrap();
    assert_eq!(crons, json!([{"name": "daily-generation", "state": "RUNNING"}]));

    let stopped = client
        .call("stopCron", vec![json!("daily-generation")])
        .await
        .unwrap();
    assert_eq!(stopped["state"], json!("STOPPED"));

    // Stopping again reports the same state instead of failing.
    let stopped = client
        .call("stopCron", vec![json!("daily-generation")])
        .await
        .unwrap();
    assert_eq!(stopped["state"], json!("STOPPED"));

    let started = client
        .call("startCron", vec![json!("daily-generation")])
        .await
        .unwrap();
    assert_eq!(started["state"], json!("RUNNING"));
}

#[tokio::test]
async fn test_force_dispatches_due_work() {
    let (client, queue, _guard) = start().await;

    let result = client
        .call("forceCron", vec![json!("daily-generation")])
        .await
        .unwrap();
    // The reply is the timer itself, untouched by the forced run.
    assert_eq!(result, json!({"name": "daily-generation", "state": "RUNNING"}));
    // The due task really was dispatched.
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_timer_and_method_are_typed_errors() {
    let (client, _queue, _guard) = start().await;

    match client.call("stopCron", vec![json!("no-such-timer")]).await {
        Err(ReporterError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    match client.call("rebootEverything", vec![]).await {
        Err(ReporterError::MethodNotFound { .. }) => {}
        other => panic!("expected MethodNotFound, got {other:?}"),
    }
}
