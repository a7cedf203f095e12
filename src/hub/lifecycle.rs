use crate::domain::challenge::{
    Challenge, ChallengeEcho, ChallengeParams, Confirmation, RejectReason, VerificationHandler,
};
use crate::domain::ports::{StoreError, SubscriptionStore, TransportError, Verifier, VerifyError};
use crate::domain::subscription::{
    Mode, PendingVerification, Secret, Subscription, SubscriptionKey, SubscriptionState,
    TransitionError, ValidationError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Bound on the challenge round-trip to the callback.
    pub verification_timeout: Duration,

    /// How long an issued challenge stays confirmable.
    pub challenge_ttl: Duration,

    /// Lease applied when a request carries none. `None` means no expiry.
    pub default_lease_seconds: Option<u32>,

    /// Requested leases are clamped to this.
    pub max_lease_seconds: Option<u32>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            verification_timeout: Duration::from_secs(10),
            challenge_ttl: Duration::from_secs(30),
            default_lease_seconds: None,
            max_lease_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: String,
    pub callback: String,
    pub lease_seconds: Option<u32>,
    pub secret: Option<Secret>,
    pub verify_token: Option<String>,
}

impl SubscribeRequest {
    pub fn new(topic: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            callback: callback.into(),
            lease_seconds: None,
            secret: None,
            verify_token: None,
        }
    }

    pub fn with_lease(mut self, lease_seconds: u32) -> Self {
        self.lease_seconds = Some(lease_seconds);
        self
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_verify_token(mut self, token: impl Into<String>) -> Self {
        self.verify_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub topic: String,
    pub callback: String,
    pub verify_token: Option<String>,
}

impl UnsubscribeRequest {
    pub fn new(topic: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            callback: callback.into(),
            verify_token: None,
        }
    }
}

/// Why a handshake did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The echo did not match the pending challenge.
    Rejected(RejectReason),
    /// The callback answered with a non-success status.
    Refused { status: u16 },
    /// The callback could not be reached.
    Unreachable(String),
    TimedOut,
}

/// Terminal result of one subscribe or unsubscribe handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Subscribe: the now active record. Unsubscribe: the removed record.
    Verified(Subscription),
    Denied(DenialReason),
    /// A newer handshake for the same pair took over before this one settled.
    Superseded,
    /// Unsubscribe for a pair with nothing active. Nothing changed.
    NotSubscribed,
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Verified(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Serializes read-modify-write cycles per subscription key.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<SubscriptionKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &SubscriptionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Drives subscriptions through request, verification, activation, renewal,
/// unsubscription and expiry.
///
/// Every transition on a record happens under that record's key lock and is
/// committed only once the store accepts the write. The challenge round-trip
/// runs outside the lock; when it settles, the record is re-read and left
/// untouched if a newer handshake has replaced its pending token.
pub struct LifecycleController {
    store: Arc<dyn SubscriptionStore>,
    verifier: Arc<dyn Verifier>,
    challenges: VerificationHandler,
    locks: KeyLocks,
    config: LifecycleConfig,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        verifier: Arc<dyn Verifier>,
        config: LifecycleConfig,
    ) -> Self {
        let challenges = VerificationHandler::new(config.challenge_ttl);
        Self::with_challenges(store, verifier, challenges, config)
    }

    pub fn with_challenges(
        store: Arc<dyn SubscriptionStore>,
        verifier: Arc<dyn Verifier>,
        challenges: VerificationHandler,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            challenges,
            locks: KeyLocks::default(),
            config,
        }
    }

    pub fn challenges(&self) -> &VerificationHandler {
        &self.challenges
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Subscribe or renew, verifying with the callback before activating.
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<VerificationOutcome, LifecycleError> {
        let key = validate_key(&request.topic, &request.callback)?;
        let lease_seconds = self.effective_lease(request.lease_seconds)?;

        let challenge = {
            let _guard = self.locks.lock(&key).await;
            let now = OffsetDateTime::now_utc();

            let mut record = match self.store.get(&key).await? {
                Some(mut existing) => match existing.effective_state(now) {
                    SubscriptionState::Active
                    | SubscriptionState::Requested
                    | SubscriptionState::Verifying => existing,
                    SubscriptionState::UnsubscribeRequested
                    | SubscriptionState::UnsubscribeVerifying => {
                        existing.revert_unsubscribe()?;
                        existing
                    }
                    SubscriptionState::Denied
                    | SubscriptionState::Expired
                    | SubscriptionState::Removed => Subscription::requested(&key, now),
                },
                None => Subscription::requested(&key, now),
            };

            if record.state == SubscriptionState::Requested {
                self.store.put(record.clone()).await?;
                info!(key = %key, "Subscription requested");
            } else {
                debug!(key = %key, state = ?record.state, "Re-verifying existing subscription");
            }

            let challenge = self
                .challenges
                .issue(ChallengeParams {
                    topic: key.topic.clone(),
                    callback: key.callback.clone(),
                    mode: Mode::Subscribe,
                    lease_seconds,
                    verify_token: request.verify_token.clone(),
                })
                .await;

            record.begin_verification(PendingVerification {
                token: challenge.token.clone(),
                mode: Mode::Subscribe,
                lease_seconds,
                secret: request.secret.clone(),
            })?;
            self.commit_pending(&key, &challenge, record).await?;
            challenge
        };

        let answer = self.ask_counterparty(&challenge).await;
        self.settle(&key, &challenge, answer).await
    }

    /// Unsubscribe, verifying with the callback before removing.
    pub async fn unsubscribe(
        &self,
        request: UnsubscribeRequest,
    ) -> Result<VerificationOutcome, LifecycleError> {
        let key = validate_key(&request.topic, &request.callback)?;

        let challenge = {
            let _guard = self.locks.lock(&key).await;
            let now = OffsetDateTime::now_utc();

            let Some(mut record) = self.store.get(&key).await? else {
                debug!(key = %key, "Unsubscribe for unknown subscription");
                return Ok(VerificationOutcome::NotSubscribed);
            };

            match record.effective_state(now) {
                SubscriptionState::Active => {
                    record.request_unsubscribe()?;
                    self.store.put(record.clone()).await?;
                    info!(key = %key, "Unsubscribe requested");
                }
                SubscriptionState::UnsubscribeRequested
                | SubscriptionState::UnsubscribeVerifying => {
                    debug!(key = %key, "Restarting unsubscribe verification");
                }
                state => {
                    debug!(key = %key, state = ?state, "Nothing active to unsubscribe");
                    return Ok(VerificationOutcome::NotSubscribed);
                }
            }

            let challenge = self
                .challenges
                .issue(ChallengeParams {
                    topic: key.topic.clone(),
                    callback: key.callback.clone(),
                    mode: Mode::Unsubscribe,
                    lease_seconds: None,
                    verify_token: request.verify_token.clone(),
                })
                .await;

            record.begin_unsubscribe_verification(PendingVerification {
                token: challenge.token.clone(),
                mode: Mode::Unsubscribe,
                lease_seconds: None,
                secret: None,
            })?;
            self.commit_pending(&key, &challenge, record).await?;
            challenge
        };

        let answer = self.ask_counterparty(&challenge).await;
        self.settle(&key, &challenge, answer).await
    }

    /// Administrative removal from any state. Returns whether a record existed.
    pub async fn remove(&self, key: &SubscriptionKey) -> Result<bool, LifecycleError> {
        let _guard = self.locks.lock(key).await;
        self.challenges.cancel(key).await;
        let removed = self.store.remove(key).await?;
        if removed {
            info!(key = %key, "Subscription removed");
        }
        Ok(removed)
    }

    /// The record for `key`. Expired subscriptions read as absent.
    pub async fn get(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, LifecycleError> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .store
            .get(key)
            .await?
            .filter(|sub| sub.effective_state(now) != SubscriptionState::Expired))
    }

    /// Subscriptions on `topic` that are active and within their lease.
    pub async fn active_subscriptions(
        &self,
        topic: &str,
    ) -> Result<Vec<Subscription>, LifecycleError> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .store
            .list(topic)
            .await?
            .into_iter()
            .filter(|sub| sub.is_active_at(now))
            .collect())
    }

    /// Remove records on `topic` whose lease has run out. Returns the reaped keys.
    pub async fn reap_expired(&self, topic: &str) -> Result<Vec<SubscriptionKey>, LifecycleError> {
        let now = OffsetDateTime::now_utc();
        let candidates: Vec<SubscriptionKey> = self
            .store
            .list(topic)
            .await?
            .iter()
            .filter(|sub| sub.effective_state(now) == SubscriptionState::Expired)
            .map(Subscription::key)
            .collect();

        let mut reaped = Vec::new();
        for key in candidates {
            let _guard = self.locks.lock(&key).await;
            let Some(mut record) = self.store.get(&key).await? else {
                continue;
            };
            if record.expire(OffsetDateTime::now_utc()).is_ok() {
                self.store.remove(&key).await?;
                info!(key = %key, "Subscription expired");
                reaped.push(key);
            }
        }

        self.challenges.purge_expired().await;
        Ok(reaped)
    }

    fn effective_lease(&self, requested: Option<u32>) -> Result<Option<u32>, LifecycleError> {
        if requested == Some(0) {
            return Err(ValidationError::InvalidLease("0".to_string()).into());
        }
        let lease = requested.or(self.config.default_lease_seconds);
        Ok(match (lease, self.config.max_lease_seconds) {
            (Some(lease), Some(max)) => Some(lease.min(max)),
            (lease, _) => lease,
        })
    }

    /// Persist a record that now carries `challenge`; withdraw the challenge if the write fails.
    async fn commit_pending(
        &self,
        key: &SubscriptionKey,
        challenge: &Challenge,
        record: Subscription,
    ) -> Result<(), LifecycleError> {
        if let Err(e) = self.store.put(record).await {
            self.challenges.cancel_token(key, &challenge.token).await;
            return Err(e.into());
        }
        debug!(key = %key, mode = %challenge.params.mode, "Verification pending");
        Ok(())
    }

    async fn ask_counterparty(&self, challenge: &Challenge) -> Result<ChallengeEcho, DenialReason> {
        let timeout = self.config.verification_timeout;
        match tokio::time::timeout(timeout, self.verifier.verify(challenge)).await {
            Ok(Ok(echo)) => Ok(echo),
            Ok(Err(VerifyError::Refused { status })) => Err(DenialReason::Refused { status }),
            Ok(Err(VerifyError::Transport(TransportError::Timeout(_)))) | Err(_) => {
                Err(DenialReason::TimedOut)
            }
            Ok(Err(VerifyError::Transport(e))) => Err(DenialReason::Unreachable(e.to_string())),
        }
    }

    async fn settle(
        &self,
        key: &SubscriptionKey,
        challenge: &Challenge,
        answer: Result<ChallengeEcho, DenialReason>,
    ) -> Result<VerificationOutcome, LifecycleError> {
        let _guard = self.locks.lock(key).await;

        let result = match answer {
            Ok(echo) => match self.challenges.confirm(key, &echo).await {
                Confirmation::Accepted(_) => Ok(()),
                Confirmation::Rejected(reason) => Err(DenialReason::Rejected(reason)),
            },
            Err(reason) => Err(reason),
        };

        let Some(mut record) = self.store.get(key).await? else {
            debug!(key = %key, "Subscription vanished during verification");
            return Ok(VerificationOutcome::Superseded);
        };
        if record.pending_token() != Some(challenge.token.as_str()) {
            debug!(key = %key, "Verification superseded by a newer request");
            return Ok(VerificationOutcome::Superseded);
        }

        let mode = challenge.params.mode;
        match (result, mode) {
            (Ok(()), Mode::Subscribe) => {
                record.activate(OffsetDateTime::now_utc())?;
                self.store.put(record.clone()).await?;
                info!(
                    key = %key,
                    lease_seconds = ?record.lease_seconds,
                    "Subscription active"
                );
                Ok(VerificationOutcome::Verified(record))
            }
            (Ok(()), Mode::Unsubscribe) => {
                record.confirm_removal()?;
                self.store.remove(key).await?;
                info!(key = %key, "Subscription removed by unsubscribe");
                Ok(VerificationOutcome::Verified(record))
            }
            (Err(reason), Mode::Subscribe) => {
                self.challenges.cancel_token(key, &challenge.token).await;
                record.deny()?;
                self.store.put(record).await?;
                warn!(key = %key, reason = ?reason, "Subscription denied");
                Ok(VerificationOutcome::Denied(reason))
            }
            (Err(reason), Mode::Unsubscribe) => {
                self.challenges.cancel_token(key, &challenge.token).await;
                record.revert_unsubscribe()?;
                self.store.put(record).await?;
                warn!(key = %key, reason = ?reason, "Unsubscribe not verified, subscription kept");
                Ok(VerificationOutcome::Denied(reason))
            }
        }
    }
}

pub(crate) fn validate_key(topic: &str, callback: &str) -> Result<SubscriptionKey, ValidationError> {
    if topic.trim().is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    match reqwest::Url::parse(callback) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            Ok(SubscriptionKey::new(topic, callback))
        }
        _ => Err(ValidationError::InvalidCallback(callback.to_string())),
    }
}
