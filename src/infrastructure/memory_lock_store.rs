//! In-process lease store
//!
//! Leases expire after their TTL so a crashed holder cannot block a bot
//! forever. Only the token returned by `try_acquire` can release a lease.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::LockError;
use crate::domain::repositories::lock_store::{LeaseToken, LockStore};

#[derive(Debug, Clone, Copy)]
struct Lease {
    nonce: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(None);
            }
            debug!("Lease {} expired, taking it over", key);
        }

        let nonce = Uuid::new_v4();
        leases.insert(
            key.to_string(),
            Lease {
                nonce,
                expires_at: now + ttl,
            },
        );
        Ok(Some(LeaseToken {
            key: key.to_string(),
            nonce,
        }))
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now()))
    }

    async fn extend(&self, token: &LeaseToken, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&token.key) {
            Some(lease) if lease.nonce == token.nonce && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LeaseToken) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        match leases.get(&token.key) {
            Some(lease) if lease.nonce == token.nonce => {
                let expired = lease.expires_at <= Instant::now();
                leases.remove(&token.key);
                Ok(!expired)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = MemoryLockStore::new();
        let token = store.try_acquire("bot-lock:1", TTL).await.unwrap().unwrap();

        assert!(store.try_acquire("bot-lock:1", TTL).await.unwrap().is_none());
        assert!(store.try_acquire("bot-lock:2", TTL).await.unwrap().is_some());
        assert!(store.is_locked("bot-lock:1").await.unwrap());

        assert!(store.release(&token).await.unwrap());
        assert!(!store.is_locked("bot-lock:1").await.unwrap());
        assert!(store.try_acquire("bot-lock:1", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemoryLockStore::new();
        let token = store.try_acquire("k", TTL).await.unwrap().unwrap();
        let forged = LeaseToken {
            key: "k".to_string(),
            nonce: Uuid::new_v4(),
        };

        assert!(!store.release(&forged).await.unwrap());
        assert!(store.is_locked("k").await.unwrap());
        assert!(store.release(&token).await.unwrap());
        assert!(!store.release(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MemoryLockStore::new();
        let stale = store
            .try_acquire("k", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_locked("k").await.unwrap());

        let fresh = store.try_acquire("k", TTL).await.unwrap().unwrap();
        assert_ne!(stale.nonce, fresh.nonce);
        assert!(!store.release(&stale).await.unwrap());
        assert!(store.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_keeps_lease_alive() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_millis(150);
        let token = store.try_acquire("k", ttl).await.unwrap().unwrap();

        // Outlives the original ttl
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.extend(&token, ttl).await.unwrap());
        }
        assert!(store.try_acquire("k", ttl).await.unwrap().is_none());
        assert!(store.release(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_fails_once_lease_is_lost() {
        let store = MemoryLockStore::new();
        let stale = store
            .try_acquire("k", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.extend(&stale, TTL).await.unwrap());

        let fresh = store.try_acquire("k", TTL).await.unwrap().unwrap();
        assert!(!store.extend(&stale, TTL).await.unwrap());
        assert!(store.extend(&fresh, TTL).await.unwrap());
    }
}
