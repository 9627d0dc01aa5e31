use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::QueueError;

/// "Please execute order X"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub order_id: Uuid,
}

/// Shared work queue; every `receive` caller competes for the next message
#[async_trait]
pub trait OrderQueue: Send + Sync {
    async fn publish(&self, message: OrderMessage) -> Result<(), QueueError>;

    /// Waits for the next message; `QueueError::Closed` once drained and closed
    async fn receive(&self) -> Result<OrderMessage, QueueError>;
}
