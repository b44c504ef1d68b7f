use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::models::{Generation, GenerationRequest, Task};

/// Result of a worker claiming a generation for processing.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The generation is now PROCESSING and owned by the caller. A
    /// redelivered message re-claims rather than duplicating.
    Claimed(Generation),
    /// The generation already reached a terminal state; the caller
    /// acknowledges the message and does nothing.
    AlreadyTerminal(Generation),
}

/// Terminal outcome recorded by the worker after the rendering step.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub success: bool,
    pub took_ms: u64,
    pub cause: Option<String>,
}

/// Persistence seam for the generation lifecycle. The relational
/// implementation lives with the API service; the in-memory one backs
/// tests and embedded runs.
#[async_trait]
pub trait GenerationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Generation>>;

    /// Idempotent claim: creates the record if the producer's row has
    /// not been seen yet, moves PENDING/PROCESSING to PROCESSING, and
    /// reports terminal records as such without touching them.
    async fn claim(&self, request: &GenerationRequest, now: DateTime<Utc>) -> Result<ClaimOutcome>;

    /// Records the terminal state. A generation that is already
    /// terminal is returned unchanged, so a duplicate delivery can
    /// never produce two divergent terminal states.
    async fn complete(&self, id: &str, outcome: GenerationOutcome) -> Result<Generation>;

    /// External cancellation; never called by workers.
    async fn abort(&self, id: &str) -> Result<Generation>;
}

/// Scheduling-domain store consumed by the cron scheduler.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Tasks with `next_run <= now` that are enabled.
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Records a completed dispatch: sets `last_run` and the freshly
    /// recomputed `next_run`.
    async fn record_run(
        &self,
        task_id: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()>;

    async fn upsert(&self, task: Task) -> Result<()>;
}
