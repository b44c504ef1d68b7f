//! Worker side of the generation queue: claims jobs, runs the report
//! executor, and records terminal outcomes before acknowledging.

pub mod worker;

pub use worker::{GenerationExecutor, GenerationWorker};
