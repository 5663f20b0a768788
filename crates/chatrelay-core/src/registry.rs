//! Stream registry - single-use tokens for pending streams
//!
//! The transport registers a pending stream and hands the token to the
//! caller; the first consumption removes it. Entries that are never consumed
//! expire after a TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

struct Pending<T> {
    value: T,
    created_at: Instant,
}

pub struct StreamRegistry<T> {
    entries: Mutex<HashMap<String, Pending<T>>>,
    ttl: Duration,
}

impl<T: Send> StreamRegistry<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store `value` under a fresh opaque token
    pub async fn register(&self, value: T) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut entries = self.entries.lock().await;
        Self::sweep(&mut entries, self.ttl);
        entries.insert(
            token.clone(),
            Pending {
                value,
                created_at: Instant::now(),
            },
        );
        debug!(token = %token, pending = entries.len(), "Stream registered");
        token
    }

    /// Remove and return the entry; `None` if unknown, taken or expired
    pub async fn take(&self, token: &str) -> Option<T> {
        let mut entries = self.entries.lock().await;
        let pending = entries.remove(token)?;
        if pending.created_at.elapsed() > self.ttl {
            debug!(token = %token, "Stream token expired");
            return None;
        }
        Some(pending.value)
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        Self::sweep(&mut entries, self.ttl)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn sweep(entries: &mut HashMap<String, Pending<T>>, ttl: Duration) -> usize {
        let before = entries.len();
        entries.retain(|_, p| p.created_at.elapsed() <= ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_is_single_use() {
        let registry = StreamRegistry::new(Duration::from_secs(60));
        let token = registry.register("hello".to_string()).await;
        assert_eq!(token.len(), 32);

        assert_eq!(registry.take(&token).await.as_deref(), Some("hello"));
        assert_eq!(registry.take(&token).await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let registry: StreamRegistry<String> = StreamRegistry::new(Duration::from_secs(60));
        assert_eq!(registry.take("nope").await, None);
    }

    #[tokio::test]
    async fn test_tokens_are_distinct() {
        let registry = StreamRegistry::new(Duration::from_secs(60));
        let a = registry.register(1).await;
        let b = registry.register(2).await;
        assert_ne!(a, b);
        assert_eq!(registry.take(&b).await, Some(2));
        assert_eq!(registry.take(&a).await, Some(1));
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let registry = StreamRegistry::new(Duration::from_millis(10));
        let token = registry.register("late").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.take(&token).await, None);

        registry.register("a").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.purge_expired().await, 1);
        assert!(registry.is_empty().await);
    }
}
