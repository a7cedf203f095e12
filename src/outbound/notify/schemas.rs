use crate::domain::subscription::Subscriber;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Content pushed to subscribers: an opaque payload and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,

    pub content_type: String,

    pub payload: Bytes,
}

impl Notification {
    pub fn new(
        topic: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            content_type: content_type.into(),
            payload: payload.into(),
        }
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,

    Failed,

    TimedOut,
}

/// Per-subscriber delivery record produced by the notifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSummary {
    pub topic: String,

    pub subscriber: Subscriber,

    pub outcome: DeliveryOutcome,

    pub status_code: Option<u16>,

    pub error: Option<String>,

    pub response_time_ms: Option<u64>,

    /// Subscriber-reported audience size (`X-Hub-On-Behalf-Of`).
    pub on_behalf_of: Option<u32>,

    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SubscriptionSummary {
    fn base(topic: &str, subscriber: &Subscriber, outcome: DeliveryOutcome) -> Self {
        Self {
            topic: topic.to_string(),
            subscriber: subscriber.clone(),
            outcome,
            status_code: None,
            error: None,
            response_time_ms: None,
            on_behalf_of: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn delivered(
        topic: &str,
        subscriber: &Subscriber,
        status_code: u16,
        response_time_ms: u64,
    ) -> Self {
        Self {
            status_code: Some(status_code),
            response_time_ms: Some(response_time_ms),
            ..Self::base(topic, subscriber, DeliveryOutcome::Delivered)
        }
    }

    pub fn failed(
        topic: &str,
        subscriber: &Subscriber,
        status_code: Option<u16>,
        error: String,
    ) -> Self {
        Self {
            status_code,
            error: Some(error),
            ..Self::base(topic, subscriber, DeliveryOutcome::Failed)
        }
    }

    pub fn timed_out(topic: &str, subscriber: &Subscriber, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::base(topic, subscriber, DeliveryOutcome::TimedOut)
        }
    }

    pub fn with_on_behalf_of(mut self, count: Option<u32>) -> Self {
        self.on_behalf_of = count;
        self
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == DeliveryOutcome::Delivered
    }
}
