//! RPC surface of the scheduler: the cron control procedures served on
//! the scheduler queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use reporter_broker::RpcRouter;
use reporter_core::errors::{ReporterError, Result};

use crate::scheduler::CronScheduler;

/// Maps control method names onto the scheduler. Argument validation
/// happens here; the scheduler itself only sees well-formed names.
pub struct CronControl {
    scheduler: Arc<CronScheduler>,
}

impl CronControl {
    pub fn new(scheduler: Arc<CronScheduler>) -> Self {
        Self { scheduler }
    }

    fn timer_arg(args: &[Value]) -> Result<&str> {
        args.first()
            .and_then(Value::as_str)
            .ok_or_else(|| ReporterError::internal("expected a timer name argument"))
    }
}

#[async_trait]
impl RpcRouter for CronControl {
    async fn handle(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "getAllCrons" => Ok(serde_json::to_value(self.scheduler.get_all_crons())?),
            "stopCron" => {
                let info = self.scheduler.stop_cron(Self::timer_arg(args)?)?;
                Ok(serde_json::to_value(info)?)
            }
            "startCron" => {
                let info = self.scheduler.start_cron(Self::timer_arg(args)?)?;
                Ok(serde_json::to_value(info)?)
            }
            "forceCron" => {
                let info = self.scheduler.force_cron(Self::timer_arg(args)?).await?;
                Ok(serde_json::to_value(info)?)
            }
            other => Err(ReporterError::method_not_found(other)),
        }
    }
}
