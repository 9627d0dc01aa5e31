use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::LockError;

/// Proof of holding a lease; only the holder can release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub key: String,
    pub nonce: Uuid,
}

/// Key-value lease store with atomic acquire-if-absent
#[async_trait]
pub trait LockStore: Send + Sync {
    /// `Ok(None)` when the key is held by someone else
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError>;

    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;

    /// Pushes the expiry of a lease still held by `token` to `ttl` from now.
    /// Returns false when the lease already expired or was taken over.
    async fn extend(&self, token: &LeaseToken, ttl: Duration) -> Result<bool, LockError>;

    /// Returns false when the lease already expired or was taken over
    async fn release(&self, token: &LeaseToken) -> Result<bool, LockError>;
}
