//! Request/reply and streaming RPC over broker queues.
//!
//! Plain calls are JSON envelopes correlated by id over a per-client
//! reply queue. Streams are negotiated through the same request path
//! and then carried on dedicated per-stream queues.

pub mod client;
pub mod server;
pub mod stream;

pub use client::RpcClient;
pub use server::{RpcRouter, RpcServer};
pub use stream::{chunks_of, ReadStream, StreamServer, StreamSource};
