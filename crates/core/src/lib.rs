//! Domain models, error taxonomy, configuration and component seams
//! shared by every reporter service.

pub mod config;
pub mod errors;
pub mod memory_store;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::{ReporterError, Result};
