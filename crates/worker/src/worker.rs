use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use reporter_broker::GenerationQueue;
use reporter_core::errors::Result;
use reporter_core::models::{Generation, GenerationRequest};
use reporter_core::traits::{ClaimOutcome, Delivery, GenerationOutcome, GenerationStore};

/// Renders one report generation. Implementations own the actual
/// document pipeline; the worker only cares whether the run succeeded.
#[async_trait]
pub trait GenerationExecutor: Send + Sync {
    async fn execute(&self, generation: &Generation) -> Result<()>;
}

/// Consumes the generation queue one job at a time. The contract with
/// the queue is at-least-once: the delivery is acknowledged only after
/// a terminal state is durably recorded, and a redelivered job that
/// already finished is acknowledged without running again.
pub struct GenerationWorker {
    queue: Arc<GenerationQueue>,
    store: Arc<dyn GenerationStore>,
    executor: Arc<dyn GenerationExecutor>,
}

impl GenerationWorker {
    pub fn new(
        queue: Arc<GenerationQueue>,
        store: Arc<dyn GenerationStore>,
        executor: Arc<dyn GenerationExecutor>,
    ) -> Self {
        Self {
            queue,
            store,
            executor,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut rx = self.queue.consume("generation-worker").await?;
        info!(queue = %self.queue.queue_name(), "generation worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("generation worker stopping");
                    return Ok(());
                }
                delivery = rx.recv() => match delivery {
                    Some(delivery) => self.process(delivery).await,
                    None => {
                        warn!("generation consumer closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let request: GenerationRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                // A poison message would otherwise redeliver forever.
                warn!("discarding malformed generation request: {e}");
                let _ = delivery.acker.ack().await;
                return;
            }
        };

        let generation = match self.store.claim(&request, Utc::now()).await {
            Ok(ClaimOutcome::Claimed(generation)) => generation,
            Ok(ClaimOutcome::AlreadyTerminal(generation)) => {
                info!(
                    generation_id = %generation.id,
                    status = ?generation.status,
                    "duplicate delivery of a finished generation, skipping"
                );
                let _ = delivery.acker.ack().await;
                return;
            }
            Err(e) => {
                error!(generation_id = %request.id, "claim failed, requeueing: {e}");
                let _ = delivery.acker.nack_requeue().await;
                return;
            }
        };

        let started = Instant::now();
        let outcome = match self.executor.execute(&generation).await {
            Ok(()) => GenerationOutcome {
                success: true,
                took_ms: started.elapsed().as_millis() as u64,
                cause: None,
            },
            Err(e) => {
                error!(generation_id = %generation.id, "generation failed: {e}");
                GenerationOutcome {
                    success: false,
                    took_ms: started.elapsed().as_millis() as u64,
                    cause: Some(e.to_string()),
                }
            }
        };

        // Terminal state first, acknowledgement second. Crashing in
        // between redelivers the job, and the claim then resolves it as
        // already terminal.
        match self.store.complete(&generation.id, outcome).await {
            Ok(finished) => {
                info!(
                    generation_id = %finished.id,
                    status = ?finished.status,
                    took_ms = ?finished.took_ms,
                    "generation finished"
                );
                if let Err(e) = delivery.acker.ack().await {
                    warn!(generation_id = %finished.id, "failed to ack generation: {e}");
                }
            }
            Err(e) => {
                error!(generation_id = %generation.id, "failed to record outcome, requeueing: {e}");
                let _ = delivery.acker.nack_requeue().await;
            }
        }
    }
}
