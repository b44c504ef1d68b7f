//! Cron scheduler: fixed-interval timers that sweep the task store and
//! dispatch due report generations onto the durable queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use reporter_broker::GenerationQueue;
use reporter_core::config::SchedulerConfig;
use reporter_core::errors::{ReporterError, Result};
use reporter_core::models::{CronTimerInfo, CronTimerState, GenerationRequest, Recurrence};
use reporter_core::traits::TaskStore;

struct TimerEntry {
    interval: Duration,
    state: CronTimerState,
}

/// Outcome of one due-task sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub dispatched: u32,
    /// Ids of due tasks passed over because their recurrence did not
    /// parse. They stay due and show up again on the next sweep.
    pub skipped: Vec<String>,
}

/// Owns the configured timers and the due-task sweep they trigger.
/// Timer state is controlled remotely over RPC; stopping a timer only
/// pauses its tick, it never loses scheduled work because due tasks
/// stay due until dispatched.
pub struct CronScheduler {
    queue: Arc<GenerationQueue>,
    tasks: Arc<dyn TaskStore>,
    timers: Mutex<HashMap<String, TimerEntry>>,
}

impl CronScheduler {
    pub fn new(
        config: &SchedulerConfig,
        queue: Arc<GenerationQueue>,
        tasks: Arc<dyn TaskStore>,
    ) -> Self {
        let timers = config
            .timers
            .iter()
            .map(|timer| {
                (
                    timer.name.clone(),
                    TimerEntry {
                        interval: Duration::from_secs(timer.interval_seconds),
                        state: CronTimerState::Running,
                    },
                )
            })
            .collect();
        Self {
            queue,
            tasks,
            timers: Mutex::new(timers),
        }
    }

    /// Runs every configured timer until shutdown. A stopped timer
    /// keeps ticking but skips the sweep, so restarting it needs no
    /// task respawn.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) -> Result<()> {
        let names: Vec<(String, Duration)> = self
            .timers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.interval))
            .collect();
        let mut handles = Vec::new();
        for (name, interval) in names {
            let scheduler = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                info!(timer = %name, interval_seconds = interval.as_secs(), "cron timer started");
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // immediate first tick, skip it
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!(timer = %name, "cron timer stopping");
                            return;
                        }
                        _ = ticker.tick() => {
                            let running = scheduler
                                .timers
                                .lock()
                                .unwrap()
                                .get(&name)
                                .map(|entry| entry.state == CronTimerState::Running)
                                .unwrap_or(false);
                            if !running {
                                debug!(timer = %name, "timer stopped, skipping sweep");
                                continue;
                            }
                            match scheduler.run_due_tasks(Utc::now()).await {
                                Ok(report) => {
                                    if !report.skipped.is_empty() {
                                        warn!(
                                            timer = %name,
                                            skipped = ?report.skipped,
                                            "tasks with invalid recurrence left undispatched"
                                        );
                                    }
                                    if report.dispatched > 0 {
                                        info!(timer = %name, count = report.dispatched, "dispatched generations");
                                    }
                                }
                                Err(e) => error!(timer = %name, "sweep failed: {e}"),
                            }
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Sweeps the task store and enqueues a generation for every due
    /// task. A task with an invalid recurrence is skipped (and keeps
    /// its due date) without affecting the rest of the sweep; the
    /// report carries the skipped ids. A queue failure aborts the
    /// sweep so nothing is marked as run without being enqueued.
    pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = self.tasks.due_tasks(now).await?;
        let mut report = SweepReport::default();
        for task in due {
            let recurrence = match Recurrence::parse(&task.recurrence) {
                Ok(recurrence) => recurrence,
                Err(e) => {
                    warn!(task_id = %task.id, "skipping task: {e}");
                    report.skipped.push(task.id.clone());
                    continue;
                }
            };
            let start = recurrence.previous_from(now)?;
            let request =
                GenerationRequest::new(&task.id, start, now, task.targets.clone(), "cron");
            self.queue.enqueue(&request).await?;

            let next_run = recurrence.next_from(now)?;
            self.tasks.record_run(&task.id, now, next_run).await?;
            debug!(task_id = %task.id, generation_id = %request.id, %next_run, "task dispatched");
            report.dispatched += 1;
        }
        Ok(report)
    }

    pub fn get_all_crons(&self) -> Vec<CronTimerInfo> {
        let timers = self.timers.lock().unwrap();
        let mut infos: Vec<CronTimerInfo> = timers
            .iter()
            .map(|(name, entry)| CronTimerInfo {
                name: name.clone(),
                state: entry.state,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Pauses a timer. Already stopped is not an error.
    pub fn stop_cron(&self, name: &str) -> Result<CronTimerInfo> {
        self.set_state(name, CronTimerState::Stopped)
    }

    /// Resumes a timer. Already running is not an error.
    pub fn start_cron(&self, name: &str) -> Result<CronTimerInfo> {
        self.set_state(name, CronTimerState::Running)
    }

    /// Runs one sweep immediately, regardless of the timer's state and
    /// without disturbing its tick cadence. Returns the timer as it
    /// stands after the sweep; its state is untouched by forcing.
    pub async fn force_cron(&self, name: &str) -> Result<CronTimerInfo> {
        let info = {
            let timers = self.timers.lock().unwrap();
            let entry = timers
                .get(name)
                .ok_or_else(|| ReporterError::not_found(format!("cron timer {name}")))?;
            CronTimerInfo {
                name: name.to_string(),
                state: entry.state,
            }
        };
        warn!(timer = %name, "forced sweep requested");
        let report = self.run_due_tasks(Utc::now()).await?;
        info!(
            timer = %name,
            dispatched = report.dispatched,
            skipped = report.skipped.len(),
            "forced sweep finished"
        );
        Ok(info)
    }

    fn set_state(&self, name: &str, state: CronTimerState) -> Result<CronTimerInfo> {
        let mut timers = self.timers.lock().unwrap();
        let entry = timers
            .get_mut(name)
            .ok_or_else(|| ReporterError::not_found(format!("cron timer {name}")))?;
        if entry.state != state {
            info!(timer = %name, ?state, "timer state changed");
            entry.state = state;
        }
        Ok(CronTimerInfo {
            name: name.to_string(),
            state: entry.state,
        })
    }
}
