pub mod cron;
pub mod envelope;
pub mod generation;
pub mod heartbeat;
pub mod task;

pub use cron::{CronTimerInfo, CronTimerState};
pub use envelope::{RpcErrorBody, RpcReply, RpcRequest, StreamAbort, StreamChunk};
pub use generation::{Generation, GenerationRequest, GenerationStatus};
pub use heartbeat::HeartbeatRecord;
pub use task::{calc_next_date_from_recurrence, Recurrence, Task};
