use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Protocol limit on the size of a shared secret, in bytes.
pub const MAX_SECRET_LEN: usize = 200;

/// Identifies a subscription: one record per (topic, callback) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub topic: String,
    pub callback: String,
}

impl SubscriptionKey {
    pub fn new(topic: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            callback: callback.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.topic, self.callback)
    }
}

/// The party receiving notifications: a callback endpoint plus an opaque id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub callback: String,
}

impl Subscriber {
    pub fn new(callback: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            callback: callback.into(),
        }
    }
}

/// Handshake direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Subscribe,
    Unsubscribe,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Subscribe => "subscribe",
            Mode::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared secret used to sign deliveries. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Result<Self, ValidationError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ValidationError::EmptySecret);
        }
        if secret.len() > MAX_SECRET_LEN {
            return Err(ValidationError::SecretTooLong(secret.len()));
        }
        Ok(Self(secret))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Contract violations detected while building a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("lease must be a positive number of seconds, got {0}")]
    InvalidLease(String),

    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("invalid callback endpoint {0}")]
    InvalidCallback(String),

    #[error("secret must not be empty")]
    EmptySecret,

    #[error("secret is {0} bytes, limit is {MAX_SECRET_LEN}")]
    SecretTooLong(usize),
}

/// Validate a lease given as a signed number of seconds.
pub fn validate_lease(seconds: i64) -> Result<u32, ValidationError> {
    if seconds <= 0 {
        return Err(ValidationError::InvalidLease(seconds.to_string()));
    }
    u32::try_from(seconds).map_err(|_| ValidationError::InvalidLease(seconds.to_string()))
}

/// Lifecycle state of a subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Requested,
    Verifying,
    Active,
    UnsubscribeRequested,
    UnsubscribeVerifying,
    Removed,
    Denied,
    Expired,
}

/// Attempted a transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} a subscription in state {from:?}")]
pub struct TransitionError {
    pub from: SubscriptionState,
    pub action: &'static str,
}

/// The handshake a record is currently waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub token: String,
    pub mode: Mode,
    pub lease_seconds: Option<u32>,
    pub secret: Option<Secret>,
}

/// A subscriber's registration for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,

    pub subscriber: Subscriber,

    pub lease_seconds: Option<u32>,

    pub secret: Option<Secret>,

    pub state: SubscriptionState,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,

    pub pending: Option<PendingVerification>,
}

impl Subscription {
    /// A fresh record in `Requested`. Lease and secret only take effect once verified.
    pub fn requested(key: &SubscriptionKey, now: OffsetDateTime) -> Self {
        Self {
            topic: key.topic.clone(),
            subscriber: Subscriber::new(key.callback.clone()),
            lease_seconds: None,
            secret: None,
            state: SubscriptionState::Requested,
            created_at: now,
            expires_at: None,
            pending: None,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.topic.clone(), self.subscriber.callback.clone())
    }

    pub fn callback(&self) -> &str {
        &self.subscriber.callback
    }

    pub fn pending_token(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.token.as_str())
    }

    /// State as observed at `now`: an active record past its expiry reads as `Expired`.
    pub fn effective_state(&self, now: OffsetDateTime) -> SubscriptionState {
        match (self.state, self.expires_at) {
            (SubscriptionState::Active, Some(expires_at)) if expires_at <= now => {
                SubscriptionState::Expired
            }
            (state, _) => state,
        }
    }

    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.effective_state(now) == SubscriptionState::Active
    }

    /// `Requested | Verifying | Active → Verifying`. From `Active` this is a renewal.
    pub fn begin_verification(
        &mut self,
        pending: PendingVerification,
    ) -> Result<(), TransitionError> {
        match self.state {
            SubscriptionState::Requested
            | SubscriptionState::Verifying
            | SubscriptionState::Active => {
                self.state = SubscriptionState::Verifying;
                self.pending = Some(pending);
                Ok(())
            }
            from => Err(TransitionError {
                from,
                action: "verify",
            }),
        }
    }

    /// `Verifying → Active`. Starts the lease and rotates the secret if one was supplied.
    pub fn activate(&mut self, now: OffsetDateTime) -> Result<(), TransitionError> {
        if self.state != SubscriptionState::Verifying {
            return Err(TransitionError {
                from: self.state,
                action: "activate",
            });
        }
        let pending = self.pending.take().ok_or(TransitionError {
            from: self.state,
            action: "activate",
        })?;

        self.lease_seconds = pending.lease_seconds;
        self.expires_at = pending
            .lease_seconds
            .map(|secs| now + Duration::seconds(i64::from(secs)));
        if pending.secret.is_some() {
            self.secret = pending.secret;
        }
        self.state = SubscriptionState::Active;
        Ok(())
    }

    /// `Verifying → Denied`.
    pub fn deny(&mut self) -> Result<(), TransitionError> {
        if self.state != SubscriptionState::Verifying {
            return Err(TransitionError {
                from: self.state,
                action: "deny",
            });
        }
        self.pending = None;
        self.state = SubscriptionState::Denied;
        Ok(())
    }

    /// `Active → UnsubscribeRequested`.
    pub fn request_unsubscribe(&mut self) -> Result<(), TransitionError> {
        if self.state != SubscriptionState::Active {
            return Err(TransitionError {
                from: self.state,
                action: "unsubscribe",
            });
        }
        self.state = SubscriptionState::UnsubscribeRequested;
        Ok(())
    }

    /// `UnsubscribeRequested | UnsubscribeVerifying → UnsubscribeVerifying`.
    pub fn begin_unsubscribe_verification(
        &mut self,
        pending: PendingVerification,
    ) -> Result<(), TransitionError> {
        match self.state {
            SubscriptionState::UnsubscribeRequested | SubscriptionState::UnsubscribeVerifying => {
                self.state = SubscriptionState::UnsubscribeVerifying;
                self.pending = Some(pending);
                Ok(())
            }
            from => Err(TransitionError {
                from,
                action: "verify unsubscription of",
            }),
        }
    }

    /// `UnsubscribeVerifying → Removed`.
    pub fn confirm_removal(&mut self) -> Result<(), TransitionError> {
        if self.state != SubscriptionState::UnsubscribeVerifying {
            return Err(TransitionError {
                from: self.state,
                action: "confirm removal of",
            });
        }
        self.pending = None;
        self.state = SubscriptionState::Removed;
        Ok(())
    }

    /// An unresolved unsubscribe falls back to `Active`.
    pub fn revert_unsubscribe(&mut self) -> Result<(), TransitionError> {
        match self.state {
            SubscriptionState::UnsubscribeRequested | SubscriptionState::UnsubscribeVerifying => {
                self.pending = None;
                self.state = SubscriptionState::Active;
                Ok(())
            }
            from => Err(TransitionError {
                from,
                action: "revert unsubscription of",
            }),
        }
    }

    /// `Active → Expired` once the lease has elapsed.
    pub fn expire(&mut self, now: OffsetDateTime) -> Result<(), TransitionError> {
        if self.effective_state(now) != SubscriptionState::Expired {
            return Err(TransitionError {
                from: self.state,
                action: "expire",
            });
        }
        self.state = SubscriptionState::Expired;
        Ok(())
    }

    /// Administrative removal, allowed from any state.
    pub fn remove(&mut self) {
        self.pending = None;
        self.state = SubscriptionState::Removed;
    }
}
