use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use reporter_broker::{
    AmqpBroker, ConnectionManager, ConnectionState, DependencyPinger, GenerationQueue,
    HeartbeatPublisher, HeartbeatRegistry, InMemoryBroker, RpcServer,
};
use reporter_core::config::BrokerTransport;
use reporter_core::memory_store::{MemoryGenerationStore, MemoryTaskStore};
use reporter_core::models::Generation;
use reporter_core::traits::Broker;
use reporter_core::AppConfig;
use reporter_dispatcher::{CronControl, CronScheduler};
use reporter_worker::{GenerationExecutor, GenerationWorker};

use crate::readiness::{self, ReadinessState};
use crate::shutdown::ShutdownManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Scheduler,
    Worker,
    All,
}

impl AppMode {
    fn runs_scheduler(&self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    fn runs_worker(&self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    fn service_name(&self) -> &'static str {
        match self {
            AppMode::Scheduler => "reporter-scheduler",
            AppMode::Worker => "reporter-worker",
            AppMode::All => "reporter",
        }
    }
}

/// One reporter process: broker connection, heartbeats, and whichever
/// coordination components the mode selects.
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: Arc<dyn Broker>,
    connection: Option<Arc<ConnectionManager>>,
    registry: Arc<HeartbeatRegistry>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let (broker, connection): (Arc<dyn Broker>, Option<Arc<ConnectionManager>>) =
            match config.broker.transport {
                BrokerTransport::Amqp => {
                    let manager = Arc::new(
                        ConnectionManager::connect(config.broker.clone())
                            .await
                            .context("broker connection failed")?,
                    );
                    let broker = AmqpBroker::new(&manager)
                        .await
                        .context("broker channel setup failed")?;
                    (Arc::new(broker), Some(manager))
                }
                BrokerTransport::InMemory => {
                    info!("using in-memory broker transport");
                    (Arc::new(InMemoryBroker::new()), None)
                }
            };
        Ok(Self {
            config,
            mode,
            broker,
            connection,
            registry: Arc::new(HeartbeatRegistry::new()),
        })
    }

    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        let mut handles = Vec::new();

        // Health registry and our own heartbeat run in every mode.
        handles.push(tokio::spawn(self.registry.clone().run(
            self.broker.clone(),
            self.config.heartbeat.clone(),
            shutdown.subscribe(),
        )));
        let mut publisher = HeartbeatPublisher::new(
            self.broker.clone(),
            self.config.heartbeat.clone(),
            service_instance_name(self.mode.service_name()),
            env!("CARGO_PKG_VERSION"),
        );
        publisher.register_pinger(Arc::new(BrokerPinger {
            connection: self.connection.clone(),
        }));
        handles.push(tokio::spawn(publisher.run(shutdown.subscribe())));

        if self.mode.runs_scheduler() && self.config.scheduler.enabled {
            let queue = Arc::new(
                GenerationQueue::new(self.broker.clone(), self.config.generation_queue.clone())
                    .await
                    .context("generation queue setup failed")?,
            );
            let tasks = Arc::new(MemoryTaskStore::new());
            let scheduler = Arc::new(CronScheduler::new(
                &self.config.scheduler,
                queue,
                tasks,
            ));
            let server = Arc::new(RpcServer::new(
                self.broker.clone(),
                &self.config.rpc.scheduler_queue,
                self.config.rpc.server_prefetch,
                Arc::new(CronControl::new(scheduler.clone())),
            ));
            handles.push(tokio::spawn(server.serve(shutdown.subscribe())));
            handles.push(tokio::spawn(scheduler.run(shutdown.sender())));
            info!("scheduler components started");
        }

        if self.mode.runs_worker() {
            let queue = Arc::new(
                GenerationQueue::new(self.broker.clone(), self.config.generation_queue.clone())
                    .await
                    .context("generation queue setup failed")?,
            );
            let store = Arc::new(MemoryGenerationStore::new());
            let worker = Arc::new(GenerationWorker::new(
                queue,
                store,
                Arc::new(LogOnlyExecutor),
            ));
            handles.push(tokio::spawn(worker.run(shutdown.subscribe())));
            info!("worker components started");
        }

        if self.config.api.enabled {
            let state = ReadinessState {
                registry: self.registry.clone(),
                stale_after: self.config.heartbeat.stale_after(),
            };
            let bind_address = self.config.api.bind_address.clone();
            let shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                readiness::serve(&bind_address, state, shutdown_rx)
                    .await
                    .map_err(|e| reporter_core::ReporterError::internal(e.to_string()))
            }));
        }

        // Block until shutdown, then give the components their grace
        // window before the broker connection goes away.
        let mut shutdown_rx = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(Err(e))) => error!("component exited with error: {e}"),
                Ok(Err(e)) => error!("component task panicked: {e}"),
                Ok(Ok(Ok(()))) => {}
                Err(_) => error!("component did not stop within its grace window"),
            }
        }
        if let Some(connection) = &self.connection {
            connection.shutdown().await;
        }
        Ok(())
    }
}

fn service_instance_name(service: &str) -> String {
    match hostname::get() {
        Ok(host) => format!("{service}@{}", host.to_string_lossy()),
        Err(_) => service.to_string(),
    }
}

/// Reports broker reachability in this process's heartbeat.
struct BrokerPinger {
    connection: Option<Arc<ConnectionManager>>,
}

#[async_trait]
impl DependencyPinger for BrokerPinger {
    fn name(&self) -> &str {
        "broker"
    }

    async fn ping(&self) -> bool {
        match &self.connection {
            Some(connection) => *connection.state().borrow() == ConnectionState::Ready,
            // The in-memory transport cannot be unreachable.
            None => true,
        }
    }
}

/// Stand-in executor for the embedded binary: the document rendering
/// pipeline lives in its own service and registers a real executor
/// there. This one records the job as done so the queue semantics can
/// run end to end.
struct LogOnlyExecutor;

#[async_trait]
impl GenerationExecutor for LogOnlyExecutor {
    async fn execute(&self, generation: &Generation) -> reporter_core::Result<()> {
        info!(
            generation_id = %generation.id,
            task_id = %generation.task_id,
            targets = generation.targets.len(),
            "generation accepted (no renderer attached)"
        );
        Ok(())
    }
}
