//! Message bus: broker abstraction, in-process broker, and the stage
//! client.
//!
//! The pipeline only assumes topic-exchange semantics (queues bound to an
//! exchange by routing key, one unacknowledged delivery in flight per
//! consumer). The broker behind that contract is swappable; the
//! in-process [`MemoryBroker`] is the shipped implementation and what
//! every test runs against.

use crate::error::Result;
use std::time::Duration;

mod client;
mod memory;

pub use client::{BusClient, ConnectParams, ForwardParams};
pub use memory::MemoryBroker;

/// One message handed to a consumer. Must be acknowledged exactly once.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub tag: u64,
}

pub trait Broker: Send + Sync {
    fn declare_exchange(&self, name: &str, durable: bool) -> Result<()>;

    /// Declare a queue. With `passive` the queue must already exist; a
    /// missing queue is a connection error.
    fn declare_queue(&self, name: &str, durable: bool, passive: bool) -> Result<()>;

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Route a message through an exchange. Fire-and-forget; an
    /// unroutable message is dropped, a missing exchange is an error.
    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Take the next message off a queue, blocking up to `timeout`.
    /// The delivery stays unacknowledged until [`Broker::ack`].
    fn consume(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>>;

    fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Redeliver every unacknowledged message of a queue; called by the
    /// supervisor after reaping a dead instance. Returns how many were
    /// requeued.
    fn recover(&self, queue: &str) -> Result<usize>;

    fn purge_queue(&self, name: &str) -> Result<usize>;

    fn queue_depth(&self, name: &str) -> Result<usize>;
}
