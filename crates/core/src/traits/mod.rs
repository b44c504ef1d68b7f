pub mod broker;
pub mod store;

pub use broker::{Acker, Broker, Delivery, MessageProperties, NoopAcker};
pub use store::{ClaimOutcome, GenerationOutcome, GenerationStore, TaskStore};
