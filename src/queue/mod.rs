//! Durable task queue
//!
//! Deliveries are consumed under manual acknowledgement only: a message
//! stays owned by the queue until the consumer acks it, or nacks it with or
//! without requeue. Anything left unacknowledged is redelivered.

pub mod enqueue;
pub mod memory;
pub mod redis_queue;

pub use enqueue::TaskEnqueuer;
pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    /// Backend receipt used to ack or nack this delivery.
    pub tag: String,
    pub body: Vec<u8>,
    /// How many earlier deliveries of this message were requeued or never
    /// settled.
    pub redelivery_count: u32,
}

/// Lazily pulled, effectively endless sequence of deliveries. An `Err` item
/// means the underlying connection is unusable and the caller should
/// consume again.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn declare_durable_queue(&self, name: &str) -> Result<()>;
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;
}
