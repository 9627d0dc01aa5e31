//! Bounded in-process order queue
//!
//! A single mpsc channel whose receiver is shared behind a mutex, so every
//! worker calling `receive` competes for the next message and each message
//! is delivered exactly once.

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::domain::errors::QueueError;
use crate::domain::repositories::order_queue::{OrderMessage, OrderQueue};

pub struct ChannelOrderQueue {
    sender: StdMutex<Option<mpsc::Sender<OrderMessage>>>,
    receiver: Mutex<mpsc::Receiver<OrderMessage>>,
}

impl ChannelOrderQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: StdMutex::new(Some(tx)),
            receiver: Mutex::new(rx),
        }
    }

    /// Stops accepting messages; queued messages can still be received
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            if sender.take().is_some() {
                debug!("Order queue closed");
            }
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<OrderMessage>> {
        self.sender.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl OrderQueue for ChannelOrderQueue {
    async fn publish(&self, message: OrderMessage) -> Result<(), QueueError> {
        let sender = self.sender().ok_or(QueueError::Closed)?;
        sender.send(message).await.map_err(|e| {
            warn!("Failed to publish order {}: {}", message.order_id, e);
            QueueError::Publish(e.to_string())
        })
    }

    async fn receive(&self) -> Result<OrderMessage, QueueError> {
        self.receiver.lock().await.recv().await.ok_or(QueueError::Closed)
    }
}
