use crate::domain::subscription::{Mode, SubscriptionKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Produces challenge tokens.
pub type TokenSource = Arc<dyn Fn() -> String + Send + Sync>;

/// What the challenged party is asked to confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParams {
    pub topic: String,
    pub callback: String,
    pub mode: Mode,
    pub lease_seconds: Option<u32>,
    /// Opaque value supplied by the subscriber in its request, handed back unchanged.
    pub verify_token: Option<String>,
}

impl ChallengeParams {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.topic.clone(), self.callback.clone())
    }
}

/// An issued challenge, as sent to the counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub token: String,
    pub params: ChallengeParams,
}

/// What came back from the counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeEcho {
    pub token: String,
    pub topic: String,
    pub mode: Mode,
    pub lease_seconds: Option<u32>,
}

impl ChallengeEcho {
    /// An echo that repeats the challenge exactly.
    pub fn of(challenge: &Challenge) -> Self {
        Self {
            token: challenge.token.clone(),
            topic: challenge.params.topic.clone(),
            mode: challenge.params.mode,
            lease_seconds: challenge.params.lease_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Nothing pending for the pair: never issued, already confirmed, or cancelled.
    NoPendingChallenge,
    TokenMismatch,
    ParamsMismatch,
    Expired,
    /// The counterparty refused or could not be reached.
    Unanswered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Accepted(Challenge),
    Rejected(RejectReason),
}

impl Confirmation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Confirmation::Accepted(_))
    }
}

struct PendingChallenge {
    challenge: Challenge,
    issued_at: Instant,
}

/// Tracks outstanding challenges, at most one per (topic, callback).
///
/// Tokens are single-use: an accepted confirmation consumes the pending entry,
/// so replaying the same echo is rejected.
pub struct VerificationHandler {
    pending: Mutex<HashMap<SubscriptionKey, PendingChallenge>>,
    ttl: Duration,
    tokens: TokenSource,
}

impl VerificationHandler {
    /// Random tokens, pending challenges expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self::with_token_source(ttl, Arc::new(|| uuid::Uuid::new_v4().simple().to_string()))
    }

    pub fn with_token_source(ttl: Duration, tokens: TokenSource) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
            tokens,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a challenge with a freshly generated token.
    pub async fn issue(&self, params: ChallengeParams) -> Challenge {
        let token = (self.tokens)();
        self.challenge(token, params).await
    }

    /// Register `token` as the pending challenge for the pair, replacing any prior one.
    pub async fn challenge(&self, token: impl Into<String>, params: ChallengeParams) -> Challenge {
        let challenge = Challenge {
            token: token.into(),
            params,
        };
        let key = challenge.params.key();

        let mut pending = self.pending.lock().await;
        if pending.contains_key(&key) {
            debug!(key = %key, "Superseding pending challenge");
        }
        pending.insert(
            key,
            PendingChallenge {
                challenge: challenge.clone(),
                issued_at: Instant::now(),
            },
        );
        challenge
    }

    /// Check an echo against the pending challenge for `key`.
    pub async fn confirm(&self, key: &SubscriptionKey, echo: &ChallengeEcho) -> Confirmation {
        let mut pending = self.pending.lock().await;

        let Some(entry) = pending.get(key) else {
            return Confirmation::Rejected(RejectReason::NoPendingChallenge);
        };

        if entry.issued_at.elapsed() > self.ttl {
            pending.remove(key);
            return Confirmation::Rejected(RejectReason::Expired);
        }

        let expected = &entry.challenge;
        if echo.token != expected.token {
            return Confirmation::Rejected(RejectReason::TokenMismatch);
        }
        if echo.topic != expected.params.topic
            || echo.mode != expected.params.mode
            || echo.lease_seconds != expected.params.lease_seconds
        {
            return Confirmation::Rejected(RejectReason::ParamsMismatch);
        }

        match pending.remove(key) {
            Some(entry) => Confirmation::Accepted(entry.challenge),
            None => Confirmation::Rejected(RejectReason::NoPendingChallenge),
        }
    }

    /// Drop the pending challenge for `key` if its token is `token`.
    /// Returns whether anything was dropped.
    pub async fn cancel_token(&self, key: &SubscriptionKey, token: &str) -> bool {
        let mut pending = self.pending.lock().await;
        if pending
            .get(key)
            .is_some_and(|entry| entry.challenge.token == token)
        {
            pending.remove(key);
            return true;
        }
        false
    }

    /// Drop whatever is pending for `key`.
    pub async fn cancel(&self, key: &SubscriptionKey) -> bool {
        self.pending.lock().await.remove(key).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Remove challenges whose window has closed. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, entry| entry.issued_at.elapsed() <= self.ttl);
        before - pending.len()
    }
}
