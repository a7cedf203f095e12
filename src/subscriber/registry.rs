use super::requester::HubRequest;
use crate::domain::subscription::{Mode, Secret};
use crate::outbound::notify::signature::{PayloadSigner, SignatureError};
use crate::wire::{ParamNames, WireError, parse_lease, parse_mode};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A handshake this subscriber sent and has not seen verified yet.
#[derive(Debug, Clone)]
struct Intent {
    hub: String,
    mode: Mode,
    verify_token: Option<String>,
    secret: Option<Secret>,
}

/// A subscription the hub has verified with us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubscription {
    pub topic: String,
    pub hub: String,
    pub secret: Option<Secret>,
    pub verified_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

impl LocalSubscription {
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|expiry| now < expiry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeRefusal {
    #[error(transparent)]
    Malformed(#[from] WireError),

    #[error("No pending request for topic {0}")]
    UnknownTopic(String),

    #[error("Pending request is a {expected}, hub asked to {requested}")]
    ModeMismatch { expected: Mode, requested: Mode },

    #[error("Verify token does not match")]
    TokenMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("No active subscription for topic {0}")]
    UnknownTopic(String),

    #[error("Delivery carries no signature")]
    MissingSignature,

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// Subscriber-side bookkeeping: answers the hub's verification challenges
/// for requests we actually made and authenticates inbound deliveries.
///
/// Keyed by topic; one callback endpoint per topic.
#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    intents: Arc<RwLock<HashMap<String, Intent>>>,
    active: Arc<RwLock<HashMap<String, LocalSubscription>>>,
    names: ParamNames,
}

impl SubscriberRegistry {
    pub fn new(names: ParamNames) -> Self {
        Self {
            intents: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            names,
        }
    }

    /// Record the intent behind `request`. Call before sending it; a newer
    /// intent for the same topic replaces the older one.
    pub async fn track(&self, request: &HubRequest) {
        debug!(topic = %request.topic, mode = %request.mode, "Tracking hub request");
        self.intents.write().await.insert(
            request.topic.clone(),
            Intent {
                hub: request.hub.clone(),
                mode: request.mode,
                verify_token: request.verify_token.clone(),
                secret: request.secret.clone(),
            },
        );
    }

    /// Answer a verification GET. Returns the body to echo, or why the
    /// callback should refuse (answer 404).
    pub async fn answer_challenge(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<String, ChallengeRefusal> {
        let field = |name: &String| -> Result<String, WireError> {
            query
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| WireError::Missing(name.clone()))
        };

        let topic = field(&self.names.topic)?;
        let challenge = field(&self.names.challenge)?;
        let raw_mode = field(&self.names.mode)?;
        let requested = parse_mode(&raw_mode).ok_or_else(|| WireError::Unsupported {
            name: self.names.mode.clone(),
            value: raw_mode.clone(),
        })?;
        let lease_seconds = match query.get(&self.names.lease_seconds) {
            Some(raw) if !raw.is_empty() => Some(parse_lease(raw).map_err(WireError::from)?),
            _ => None,
        };
        let verify_token = query.get(&self.names.verify_token).filter(|v| !v.is_empty());

        let mut intents = self.intents.write().await;
        let intent = intents
            .get(&topic)
            .ok_or_else(|| ChallengeRefusal::UnknownTopic(topic.clone()))?;

        if intent.mode != requested {
            warn!(topic = %topic, expected = %intent.mode, requested = %requested, "Refusing challenge");
            return Err(ChallengeRefusal::ModeMismatch {
                expected: intent.mode,
                requested,
            });
        }
        if intent.verify_token.as_ref() != verify_token {
            warn!(topic = %topic, "Refusing challenge with wrong verify token");
            return Err(ChallengeRefusal::TokenMismatch);
        }

        let Some(intent) = intents.remove(&topic) else {
            return Err(ChallengeRefusal::UnknownTopic(topic));
        };
        drop(intents);

        let mut active = self.active.write().await;
        match requested {
            Mode::Subscribe => {
                let now = OffsetDateTime::now_utc();
                let expires_at = lease_seconds.map(|s| now + Duration::seconds(i64::from(s)));
                // A renewal without a secret keeps the one already on file.
                let secret = intent
                    .secret
                    .or_else(|| active.get(&topic).and_then(|s| s.secret.clone()));
                active.insert(
                    topic.clone(),
                    LocalSubscription {
                        topic: topic.clone(),
                        hub: intent.hub,
                        secret,
                        verified_at: now,
                        expires_at,
                    },
                );
                info!(topic = %topic, lease_seconds = ?lease_seconds, "Subscription verified");
            }
            Mode::Unsubscribe => {
                active.remove(&topic);
                info!(topic = %topic, "Unsubscription verified");
            }
        }

        Ok(challenge)
    }

    /// Check an inbound delivery. Subscriptions without a secret accept any
    /// body; with one, the signature header must match.
    pub async fn authenticate(
        &self,
        topic: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<(), AuthError> {
        let active = self.active.read().await;
        let subscription = active
            .get(topic)
            .filter(|s| s.is_active_at(OffsetDateTime::now_utc()))
            .ok_or_else(|| AuthError::UnknownTopic(topic.to_string()))?;

        let Some(secret) = &subscription.secret else {
            return Ok(());
        };
        let header = signature_header.ok_or(AuthError::MissingSignature)?;
        PayloadSigner::new(secret.expose())
            .verify_header(body, header)
            .inspect_err(|e| warn!(topic = %topic, error = %e, "Rejecting delivery"))?;
        Ok(())
    }

    pub async fn subscription(&self, topic: &str) -> Option<LocalSubscription> {
        self.active
            .read()
            .await
            .get(topic)
            .filter(|s| s.is_active_at(OffsetDateTime::now_utc()))
            .cloned()
    }

    pub async fn is_pending(&self, topic: &str) -> bool {
        self.intents.read().await.contains_key(topic)
    }

    /// Drop everything known about `topic`.
    pub async fn forget(&self, topic: &str) {
        self.intents.write().await.remove(topic);
        self.active.write().await.remove(topic);
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(ParamNames::default())
    }
}
