use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::schemas::{DeliveryOutcome, SubscriptionSummary};
use crate::domain::subscription::SubscriptionKey;

/// Bounded history of delivery summaries per (topic, callback).
#[derive(Debug, Clone)]
pub struct DeliveryLog {
    history: Arc<RwLock<HashMap<SubscriptionKey, Vec<SubscriptionSummary>>>>,

    /// Maximum entries kept per subscription
    max_history_per_subscription: usize,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::with_history_limit(100)
    }

    pub fn with_history_limit(max_history_per_subscription: usize) -> Self {
        Self {
            history: Arc::new(RwLock::new(HashMap::new())),
            max_history_per_subscription: max_history_per_subscription.max(1),
        }
    }

    /// Record a summary, evicting the oldest entries past the limit.
    pub async fn record(&self, summary: SubscriptionSummary) {
        let key = SubscriptionKey::new(summary.topic.clone(), summary.subscriber.callback.clone());
        let mut history = self.history.write().await;
        let entries = history.entry(key).or_default();

        entries.push(summary);

        if entries.len() > self.max_history_per_subscription {
            let excess = entries.len() - self.max_history_per_subscription;
            entries.drain(0..excess);
        }
    }

    pub async fn history(&self, key: &SubscriptionKey) -> Vec<SubscriptionSummary> {
        self.history
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn latest(&self, key: &SubscriptionKey) -> Option<SubscriptionSummary> {
        self.history
            .read()
            .await
            .get(key)
            .and_then(|entries| entries.last().cloned())
    }

    /// Count subscriptions on `topic` by the outcome of their latest delivery.
    pub async fn count_by_outcome(&self, topic: &str) -> HashMap<DeliveryOutcome, usize> {
        let history = self.history.read().await;
        let mut counts: HashMap<DeliveryOutcome, usize> = HashMap::new();

        for (key, entries) in history.iter() {
            if key.topic == topic
                && let Some(latest) = entries.last()
            {
                *counts.entry(latest.outcome).or_insert(0) += 1;
            }
        }

        counts
    }

    /// Audience on `topic` as reported by subscribers, counting each
    /// subscriber once at its latest successful delivery (default 1).
    pub async fn reported_subscribers(&self, topic: &str) -> u64 {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|(key, _)| key.topic == topic)
            .filter_map(|(_, entries)| entries.iter().rev().find(|s| s.is_delivered()))
            .map(|s| u64::from(s.on_behalf_of.unwrap_or(1)))
            .sum()
    }

    /// Forget everything recorded for one subscription.
    pub async fn forget(&self, key: &SubscriptionKey) {
        if self.history.write().await.remove(key).is_some() {
            debug!(key = %key, "Removed delivery history for subscription");
        }
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new()
    }
}
