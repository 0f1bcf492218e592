/// Queue Adapter - thin interface over a durable message queue
///
/// Delivery is at-least-once: a received job reference stays leased until
/// it is acknowledged, and an expired lease puts it back on the queue.
/// Consumers must therefore tolerate duplicates; the store's conditional
/// claim is what makes that safe.
use async_trait::async_trait;

use crate::api::BuildFinishedEvent;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub uuid: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, uuid: &str) -> Result<()>;

    /// Take the next job reference, or `None` if the queue is empty.
    async fn receive(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Move deliveries whose lease expired back onto the queue.
    async fn requeue_expired(&self) -> Result<usize>;

    async fn notify_finished(&self, event: &BuildFinishedEvent) -> Result<()>;
}
