use crate::domain::ports::{StoreError, SubscriptionStore};
use crate::domain::subscription::{Subscription, SubscriptionKey};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory subscription store, keyed by (topic, callback).
///
/// Ordered by key so `list` yields subscriptions for one topic contiguously.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubscriptionStore {
    records: Arc<RwLock<BTreeMap<SubscriptionKey, Subscription>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        let key = subscription.key();
        debug!(key = %key, state = ?subscription.state, "Storing subscription");
        self.records.write().await.insert(key, subscription);
        Ok(())
    }

    async fn remove(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self, topic: &str) -> Result<Vec<Subscription>, StoreError> {
        let records = self.records.read().await;
        let start = SubscriptionKey::new(topic, String::new());
        Ok(records
            .range(start..)
            .take_while(|(key, _)| key.topic == topic)
            .map(|(_, sub)| sub.clone())
            .collect())
    }
}
