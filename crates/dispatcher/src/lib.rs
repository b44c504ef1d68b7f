//! Scheduling side of the reporting platform: cron timers sweeping the
//! task store, and the RPC procedures that control them.

pub mod control;
pub mod scheduler;

pub use control::CronControl;
pub use scheduler::{CronScheduler, SweepReport};
