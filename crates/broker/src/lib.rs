//! Broker transports and the coordination primitives built on them:
//! RPC with correlation ids, streaming reads, heartbeats and the
//! durable generation queue.

pub mod amqp;
pub mod connection;
pub mod generation_queue;
pub mod heartbeat;
pub mod memory;
pub mod rpc;

pub use amqp::AmqpBroker;
pub use connection::{ConnectionManager, ConnectionState};
pub use generation_queue::GenerationQueue;
pub use heartbeat::{DependencyPinger, HeartbeatPublisher, HeartbeatRegistry};
pub use memory::InMemoryBroker;
pub use rpc::{RpcClient, RpcRouter, RpcServer, StreamServer, StreamSource};
