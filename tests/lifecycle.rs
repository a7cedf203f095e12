use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use hubbub::domain::{
    Challenge, ChallengeEcho, RejectReason, Secret, StoreError, Subscription, SubscriptionKey,
    SubscriptionState, SubscriptionStore, TokenSource, Transport, TransportError,
    TransportRequest, TransportResponse, VerificationHandler, Verifier, VerifyError,
};
use hubbub::hub::{
    DenialReason, LifecycleConfig, LifecycleController, LifecycleError, SubscribeRequest,
    UnsubscribeRequest, VerificationOutcome,
};
use hubbub::infrastructure::InMemorySubscriptionStore;
use hubbub::outbound::notify::{
    Notification, Notifier, NotifierConfig, PayloadSigner, format_signature_header,
};
use proptest::prelude::*;
use time::OffsetDateTime;
use tokio::sync::Mutex;

const TOPIC: &str = "feed:42";
const CALLBACK: &str = "https://sub.example/cb";

type Answer = Box<dyn Fn(&Challenge) -> Result<ChallengeEcho, VerifyError> + Send + Sync>;

/// Counterparty that answers every challenge with a scripted reply.
struct ScriptedVerifier {
    answer: Answer,
    seen: Mutex<Vec<Challenge>>,
}

impl ScriptedVerifier {
    fn new(answer: Answer) -> Arc<Self> {
        Arc::new(Self {
            answer,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn echo() -> Arc<Self> {
        Self::new(Box::new(|challenge| Ok(ChallengeEcho::of(challenge))))
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, challenge: &Challenge) -> Result<ChallengeEcho, VerifyError> {
        self.seen.lock().await.push(challenge.clone());
        (self.answer)(challenge)
    }
}

/// Counterparty that never answers.
struct Silent;

#[async_trait]
impl Verifier for Silent {
    async fn verify(&self, _challenge: &Challenge) -> Result<ChallengeEcho, VerifyError> {
        std::future::pending().await
    }
}

fn numbered_tokens() -> TokenSource {
    let next = Arc::new(AtomicUsize::new(1));
    Arc::new(move || format!("tok-{}", next.fetch_add(1, Ordering::SeqCst)))
}

fn controller(
    store: &InMemorySubscriptionStore,
    verifier: Arc<dyn Verifier>,
) -> LifecycleController {
    let config = LifecycleConfig::default();
    let challenges = VerificationHandler::with_token_source(config.challenge_ttl, numbered_tokens());
    LifecycleController::with_challenges(Arc::new(store.clone()), verifier, challenges, config)
}

fn key() -> SubscriptionKey {
    SubscriptionKey::new(TOPIC, CALLBACK)
}

#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<TransportRequest>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().await.push(request);
        Ok(TransportResponse::new(200, ""))
    }
}

#[tokio::test]
async fn test_subscribe_verify_and_notify_signed_payload() {
    let store = InMemorySubscriptionStore::new();
    let verifier = ScriptedVerifier::echo();
    let controller = controller(&store, verifier.clone());

    let before = OffsetDateTime::now_utc();
    let outcome = controller
        .subscribe(
            SubscribeRequest::new(TOPIC, CALLBACK)
                .with_lease(3600)
                .with_secret(Secret::new("s3cret").unwrap()),
        )
        .await
        .unwrap();
    let after = OffsetDateTime::now_utc();

    let VerificationOutcome::Verified(subscription) = outcome else {
        panic!("expected verification, got {outcome:?}");
    };
    assert_eq!(verifier.seen.lock().await[0].token, "tok-1");
    assert_eq!(subscription.state, SubscriptionState::Active);

    let expires_at = subscription.expires_at.unwrap();
    assert!(expires_at >= before + time::Duration::seconds(3600));
    assert!(expires_at <= after + time::Duration::seconds(3600));

    let active = controller.active_subscriptions(TOPIC).await.unwrap();
    assert_eq!(active.len(), 1);

    let transport = Arc::new(RecordingTransport::default());
    let notifier = Notifier::new(transport.clone(), NotifierConfig::default());
    let summaries = notifier
        .notify_all(active, Notification::new(TOPIC, "text/plain", "hello"))
        .await;

    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].is_delivered());
    assert_eq!(summaries[0].subscriber.callback, CALLBACK);

    let requests = transport.requests.lock().await;
    let expected = format_signature_header(&PayloadSigner::new("s3cret").sign(b"hello"));
    assert_eq!(requests[0].header_value("X-Hub-Signature"), Some(expected.as_str()));
    assert_eq!(requests[0].endpoint, CALLBACK);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_challenge_denies_after_timeout() {
    let store = InMemorySubscriptionStore::new();
    let controller = controller(&store, Arc::new(Silent));

    let outcome = controller
        .subscribe(
            SubscribeRequest::new(TOPIC, CALLBACK)
                .with_lease(3600)
                .with_secret(Secret::new("s3cret").unwrap()),
        )
        .await
        .unwrap();

    assert_eq!(outcome, VerificationOutcome::Denied(DenialReason::TimedOut));
    assert!(controller.active_subscriptions(TOPIC).await.unwrap().is_empty());

    let record = store.get(&key()).await.unwrap().unwrap();
    assert_eq!(record.state, SubscriptionState::Denied);
    assert_eq!(controller.challenges().pending_count().await, 0);
}

#[tokio::test]
async fn test_wrong_echo_is_denied() {
    let store = InMemorySubscriptionStore::new();
    let verifier = ScriptedVerifier::new(Box::new(|challenge| {
        Ok(ChallengeEcho {
            token: "not-the-token".to_string(),
            ..ChallengeEcho::of(challenge)
        })
    }));
    let controller = controller(&store, verifier);

    let outcome = controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        VerificationOutcome::Denied(DenialReason::Rejected(RejectReason::TokenMismatch))
    );
    let records = store.list(TOPIC).await.unwrap();
    assert!(records.iter().all(|r| r.state != SubscriptionState::Active));
}

#[tokio::test]
async fn test_refused_challenge_is_denied_and_can_be_retried() {
    let store = InMemorySubscriptionStore::new();
    let refusing = controller(
        &store,
        ScriptedVerifier::new(Box::new(|_| Err(VerifyError::Refused { status: 404 }))),
    );
    let outcome = refusing
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        VerificationOutcome::Denied(DenialReason::Refused { status: 404 })
    );

    // A fresh request after a denial starts over.
    let accepting = controller(&store, ScriptedVerifier::echo());
    let outcome = accepting
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK))
        .await
        .unwrap();
    assert!(outcome.is_verified());
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_renewal_keeps_one_record_with_later_expiry() {
    let store = InMemorySubscriptionStore::new();
    let controller = controller(&store, ScriptedVerifier::echo());

    let first = controller
        .subscribe(
            SubscribeRequest::new(TOPIC, CALLBACK)
                .with_lease(60)
                .with_secret(Secret::new("old").unwrap()),
        )
        .await
        .unwrap();
    let second = controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap();

    let (VerificationOutcome::Verified(first), VerificationOutcome::Verified(second)) =
        (first, second)
    else {
        panic!("both subscriptions should verify");
    };

    assert_eq!(store.list(TOPIC).await.unwrap().len(), 1);
    assert!(second.expires_at.unwrap() > first.expires_at.unwrap());
    assert_eq!(second.subscriber.id, first.subscriber.id);
    // No new secret supplied, so the old one stays.
    assert_eq!(second.secret.as_ref().map(Secret::expose), Some("old"));

    let rotated = controller
        .subscribe(
            SubscribeRequest::new(TOPIC, CALLBACK).with_secret(Secret::new("new").unwrap()),
        )
        .await
        .unwrap();
    let VerificationOutcome::Verified(rotated) = rotated else {
        panic!("renewal should verify");
    };
    assert_eq!(rotated.secret.as_ref().map(Secret::expose), Some("new"));
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let store = InMemorySubscriptionStore::new();
    let controller = controller(&store, ScriptedVerifier::echo());

    controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap();

    let removed = controller
        .unsubscribe(UnsubscribeRequest::new(TOPIC, CALLBACK))
        .await
        .unwrap();
    assert!(removed.is_verified());
    assert!(store.is_empty().await);

    let again = controller
        .unsubscribe(UnsubscribeRequest::new(TOPIC, CALLBACK))
        .await
        .unwrap();
    assert_eq!(again, VerificationOutcome::NotSubscribed);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_failed_unsubscribe_keeps_subscription_active() {
    let store = InMemorySubscriptionStore::new();
    let verifier = ScriptedVerifier::new(Box::new(|challenge| match challenge.params.mode {
        hubbub::domain::Mode::Subscribe => Ok(ChallengeEcho::of(challenge)),
        hubbub::domain::Mode::Unsubscribe => Err(VerifyError::Refused { status: 404 }),
    }));
    let controller = controller(&store, verifier);

    controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap();
    let outcome = controller
        .unsubscribe(UnsubscribeRequest::new(TOPIC, CALLBACK))
        .await
        .unwrap();

    assert!(matches!(outcome, VerificationOutcome::Denied(_)));
    let record = controller.get(&key()).await.unwrap().unwrap();
    assert_eq!(record.state, SubscriptionState::Active);
}

#[tokio::test]
async fn test_administrative_removal() {
    let store = InMemorySubscriptionStore::new();
    let controller = controller(&store, ScriptedVerifier::echo());

    controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK))
        .await
        .unwrap();
    assert!(controller.remove(&key()).await.unwrap());
    assert!(!controller.remove(&key()).await.unwrap());
    assert!(controller.get(&key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_contract_violations_are_errors() {
    let store = InMemorySubscriptionStore::new();
    let controller = controller(&store, ScriptedVerifier::echo());

    assert!(
        controller
            .subscribe(SubscribeRequest::new("", CALLBACK))
            .await
            .is_err()
    );
    assert!(
        controller
            .subscribe(SubscribeRequest::new(TOPIC, "not a url"))
            .await
            .is_err()
    );
    assert!(
        controller
            .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(0))
            .await
            .is_err()
    );
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_lease_policy_clamps_and_defaults() {
    let store = InMemorySubscriptionStore::new();
    let config = LifecycleConfig {
        default_lease_seconds: Some(600),
        max_lease_seconds: Some(86_400),
        ..LifecycleConfig::default()
    };
    let controller =
        LifecycleController::new(Arc::new(store.clone()), ScriptedVerifier::echo(), config);

    let clamped = controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(10_000_000))
        .await
        .unwrap();
    let VerificationOutcome::Verified(clamped) = clamped else {
        panic!("should verify");
    };
    assert_eq!(clamped.lease_seconds, Some(86_400));

    let defaulted = controller
        .subscribe(SubscribeRequest::new(TOPIC, "https://other.example/cb"))
        .await
        .unwrap();
    let VerificationOutcome::Verified(defaulted) = defaulted else {
        panic!("should verify");
    };
    assert_eq!(defaulted.lease_seconds, Some(600));
}

#[tokio::test]
async fn test_concurrent_subscribes_on_one_pair_leave_one_record() {
    let store = InMemorySubscriptionStore::new();
    let controller = Arc::new(controller(&store, ScriptedVerifier::echo()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(60 + i))
                    .await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            VerificationOutcome::Verified(_) | VerificationOutcome::Superseded
        ));
    }

    let records = store.list(TOPIC).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, SubscriptionState::Active);
}

/// Store whose `nth_put` (1-based) write is rejected. Every other call goes through.
struct RejectsOneWrite {
    inner: InMemorySubscriptionStore,
    nth_put: usize,
    puts: AtomicUsize,
}

impl RejectsOneWrite {
    fn new(nth_put: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemorySubscriptionStore::new(),
            nth_put,
            puts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SubscriptionStore for RejectsOneWrite {
    async fn get(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        if self.puts.fetch_add(1, Ordering::SeqCst) + 1 == self.nth_put {
            return Err(StoreError::WriteRejected("disk full".to_string()));
        }
        self.inner.put(subscription).await
    }

    async fn remove(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
        self.inner.remove(key).await
    }

    async fn list(&self, topic: &str) -> Result<Vec<Subscription>, StoreError> {
        self.inner.list(topic).await
    }
}

fn controller_over(
    store: Arc<RejectsOneWrite>,
    verifier: Arc<dyn Verifier>,
) -> LifecycleController {
    let config = LifecycleConfig::default();
    let challenges = VerificationHandler::with_token_source(config.challenge_ttl, numbered_tokens());
    LifecycleController::with_challenges(store, verifier, challenges, config)
}

#[tokio::test]
async fn test_rejected_pending_write_withdraws_the_challenge() {
    // Write 1 records the request, write 2 marks it as verifying.
    let store = RejectsOneWrite::new(2);
    let verifier = ScriptedVerifier::echo();
    let controller = controller_over(store.clone(), verifier.clone());

    let err = controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Storage(StoreError::WriteRejected(_))
    ));
    assert_eq!(controller.challenges().pending_count().await, 0);
    assert!(verifier.seen.lock().await.is_empty());

    let record = store.get(&key()).await.unwrap().unwrap();
    assert_eq!(record.state, SubscriptionState::Requested);
    assert!(controller.active_subscriptions(TOPIC).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_activation_write_is_not_verified() {
    // Write 3 is the activation after a correct echo.
    let store = RejectsOneWrite::new(3);
    let controller = controller_over(store.clone(), ScriptedVerifier::echo());

    let err = controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Storage(StoreError::WriteRejected(_))
    ));
    assert_eq!(controller.challenges().pending_count().await, 0);
    assert!(controller.active_subscriptions(TOPIC).await.unwrap().is_empty());
    let record = store.get(&key()).await.unwrap().unwrap();
    assert_ne!(record.state, SubscriptionState::Active);

    // The store is healthy again, so a retry goes through.
    let outcome = controller
        .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
        .await
        .unwrap();
    assert!(outcome.is_verified());
    assert_eq!(controller.active_subscriptions(TOPIC).await.unwrap().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_active_iff_exact_echo(
        echoed in prop_oneof![Just("tok-1".to_string()), "[a-z0-9-]{1,8}"],
        echoed_lease in prop_oneof![Just(Some(3600u32)), Just(None), (1u32..100_000).prop_map(Some)],
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let exact = echoed == "tok-1" && echoed_lease == Some(3600);
        let (outcome, state) = runtime.block_on(async {
            let store = InMemorySubscriptionStore::new();
            let token = echoed.clone();
            let verifier = ScriptedVerifier::new(Box::new(move |challenge| {
                Ok(ChallengeEcho {
                    token: token.clone(),
                    lease_seconds: echoed_lease,
                    ..ChallengeEcho::of(challenge)
                })
            }));
            let controller = controller(&store, verifier);
            let outcome = controller
                .subscribe(SubscribeRequest::new(TOPIC, CALLBACK).with_lease(3600))
                .await
                .unwrap();
            let state = store.get(&key()).await.unwrap().map(|r| r.state);
            (outcome, state)
        });

        prop_assert_eq!(outcome.is_verified(), exact);
        if exact {
            prop_assert_eq!(state, Some(SubscriptionState::Active));
        } else {
            prop_assert_eq!(state, Some(SubscriptionState::Denied));
        }
    }
}
