//! In-memory store implementations for tests and embedded runs. The
//! relational implementations are external collaborators.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{ReporterError, Result};
use crate::models::{Generation, GenerationRequest, Task};
use crate::traits::{ClaimOutcome, GenerationOutcome, GenerationStore, TaskStore};

#[derive(Default)]
pub struct MemoryGenerationStore {
    generations: Mutex<HashMap<String, Generation>>,
}

impl MemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record directly, bypassing the claim path. Test helper.
    pub fn insert(&self, generation: Generation) {
        self.generations
            .lock()
            .unwrap()
            .insert(generation.id.clone(), generation);
    }
}

#[async_trait]
impl GenerationStore for MemoryGenerationStore {
    async fn get(&self, id: &str) -> Result<Option<Generation>> {
        Ok(self.generations.lock().unwrap().get(id).cloned())
    }

    async fn claim(&self, request: &GenerationRequest, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let mut generations = self.generations.lock().unwrap();
        let entry = generations
            .entry(request.id.clone())
            .or_insert_with(|| Generation::pending(request));
        if entry.is_terminal() {
            return Ok(ClaimOutcome::AlreadyTerminal(entry.clone()));
        }
        entry.mark_processing(now);
        Ok(ClaimOutcome::Claimed(entry.clone()))
    }

    async fn complete(&self, id: &str, outcome: GenerationOutcome) -> Result<Generation> {
        let mut generations = self.generations.lock().unwrap();
        let entry = generations
            .get_mut(id)
            .ok_or_else(|| ReporterError::not_found(format!("generation {id}")))?;
        if entry.is_terminal() {
            return Ok(entry.clone());
        }
        let now = Utc::now();
        if outcome.success {
            entry.mark_success(outcome.took_ms, now);
        } else {
            entry.mark_error(
                outcome.cause.unwrap_or_else(|| "unknown error".to_string()),
                outcome.took_ms,
                now,
            );
        }
        Ok(entry.clone())
    }

    async fn abort(&self, id: &str) -> Result<Generation> {
        let mut generations = self.generations.lock().unwrap();
        let entry = generations
            .get_mut(id)
            .ok_or_else(|| ReporterError::not_found(format!("generation {id}")))?;
        if !entry.is_terminal() {
            entry.mark_aborted(Utc::now());
        }
        Ok(entry.clone())
    }
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut due: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| task.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(due)
    }

    async fn record_run(
        &self,
        task_id: &str,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ReporterError::not_found(format!("task {task_id}")))?;
        task.last_run = Some(last_run);
        task.next_run = Some(next_run);
        Ok(())
    }

    async fn upsert(&self, task: Task) -> Result<()> {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
        Ok(())
    }
}
