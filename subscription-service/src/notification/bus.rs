//! Message bus implementations.
//!
//! Each topic is a Redis stream; every event is one entry with an
//! `account_id` field holding the UTF-8 account identifier.

use super::{MessageBus, ProviderError};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

pub const ACCOUNT_FIELD: &str = "account_id";

#[derive(Clone)]
pub struct RedisStreamBus {
    manager: ConnectionManager,
}

impl RedisStreamBus {
    pub async fn connect(url: &str) -> Result<Self, ProviderError> {
        let client = Client::open(url)
            .map_err(|e| ProviderError::Configuration(format!("Invalid Redis URL: {}", e)))?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            ProviderError::Connection(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!("Connected to Redis message bus");
        Ok(Self { manager })
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, topic: &str, account_id: &str) -> Result<String, ProviderError> {
        let mut conn = self.manager.clone();
        let message_id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg(ACCOUNT_FIELD)
            .arg(account_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| ProviderError::SendFailed(format!("Failed to publish to {}: {}", topic, e)))?;

        tracing::debug!(topic = %topic, message_id = %message_id, "Published to message bus");
        Ok(message_id)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ProviderError::Connection(format!("Redis health check failed: {}", e)))?;
        Ok(())
    }
}

/// Records published messages in memory. Failures can be scripted for tests.
#[derive(Default)]
pub struct InMemoryBus {
    published: Mutex<Vec<(String, String)>>,
    unavailable: AtomicBool,
    failures_left: AtomicU32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish until set back to `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Account ids published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .map(|published| {
                published
                    .iter()
                    .filter(|(t, _)| t == topic)
                    .map(|(_, account)| account.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, account_id: &str) -> Result<String, ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Connection("bus unavailable".to_string()));
        }
        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ProviderError::SendFailed("scripted publish failure".to_string()));
        }

        let mut published = self
            .published
            .lock()
            .map_err(|_| ProviderError::SendFailed("in-memory bus lock poisoned".to_string()))?;
        published.push((topic.to_string(), account_id.to_string()));
        Ok(format!("{}-{}", topic, published.len()))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Connection("bus unavailable".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let bus = InMemoryBus::new();
        bus.fail_next(2);

        assert!(bus.publish("cancel-subscription", "a@example.com").await.is_err());
        assert!(bus.publish("cancel-subscription", "a@example.com").await.is_err());
        assert!(bus.publish("cancel-subscription", "a@example.com").await.is_ok());
        assert_eq!(bus.published("cancel-subscription"), vec!["a@example.com"]);
    }

    #[tokio::test]
    async fn unavailable_bus_rejects_everything() {
        let bus = InMemoryBus::new();
        bus.set_unavailable(true);
        assert!(bus.health_check().await.is_err());
        assert!(bus.publish("cancel-subscription", "a@example.com").await.is_err());
        assert!(bus.published("cancel-subscription").is_empty());
    }
}
