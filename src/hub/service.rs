use crate::config::HubConfig;
use crate::domain::ports::{SubscriptionStore, Transport};
use crate::domain::subscription::{Mode, Subscription, SubscriptionKey, ValidationError};
use crate::hub::lifecycle::{
    DenialReason, LifecycleController, LifecycleError, SubscribeRequest, UnsubscribeRequest,
    VerificationOutcome, validate_key,
};
use crate::outbound::notify::{
    DeliveryLog, Notification, Notifier, NotifierConfig, SubscriptionSummary,
};
use crate::outbound::verify::HttpVerifier;
use crate::wire::{HandshakeParams, ParamNames, VerifyMode, WireError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// How the hub answered a handshake call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResponse {
    /// Verification finished before answering (`204 No Content`).
    Verified,
    /// Verification continues in the background (`202 Accepted`).
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub topic: String,
    pub subscriber_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Verification failed: {0:?}")]
    VerificationFailed(DenialReason),

    #[error(transparent)]
    Lifecycle(LifecycleError),
}

impl From<WireError> for HubError {
    fn from(err: WireError) -> Self {
        HubError::InvalidRequest(err.to_string())
    }
}

impl From<ValidationError> for HubError {
    fn from(err: ValidationError) -> Self {
        HubError::InvalidRequest(err.to_string())
    }
}

impl From<LifecycleError> for HubError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Invalid(e) => e.into(),
            other => HubError::Lifecycle(other),
        }
    }
}

/// Hub facade: accepts handshake calls and publishes content to subscribers.
pub struct Hub {
    controller: Arc<LifecycleController>,
    notifier: Notifier,
    delivery_log: DeliveryLog,
    names: ParamNames,
}

impl Hub {
    pub fn new(
        controller: Arc<LifecycleController>,
        notifier: Notifier,
        delivery_log: DeliveryLog,
        names: ParamNames,
    ) -> Self {
        Self {
            controller,
            notifier,
            delivery_log,
            names,
        }
    }

    /// Wire a hub from configuration: challenges and deliveries both go out over `transport`.
    pub fn from_config(
        config: &HubConfig,
        store: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let names = config.names.clone();
        let verifier = Arc::new(HttpVerifier::new(
            transport.clone(),
            names.clone(),
            config.verification_timeout(),
        ));
        let controller = Arc::new(LifecycleController::new(
            store,
            verifier,
            config.lifecycle(),
        ));
        let notifier = Notifier::new(
            transport,
            NotifierConfig {
                delivery_timeout: config.delivery_timeout(),
                max_concurrent: config.max_concurrent(),
                hub_url: config.public_url.clone(),
                names: names.clone(),
            },
        );
        Self::new(controller, notifier, DeliveryLog::new(), names)
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn delivery_log(&self) -> &DeliveryLog {
        &self.delivery_log
    }

    pub fn names(&self) -> &ParamNames {
        &self.names
    }

    /// Handle a subscribe or unsubscribe call.
    pub async fn handle_handshake(
        &self,
        params: HandshakeParams,
    ) -> Result<HandshakeResponse, HubError> {
        validate_key(&params.topic, &params.callback)?;
        info!(
            topic = %params.topic,
            callback = %params.callback,
            mode = %params.mode,
            verify = params.verify.as_str(),
            "Handshake received"
        );

        match params.verify {
            VerifyMode::Sync => {
                let outcome = run_handshake(&self.controller, &self.delivery_log, params).await?;
                match outcome {
                    VerificationOutcome::Verified(_) | VerificationOutcome::NotSubscribed => {
                        Ok(HandshakeResponse::Verified)
                    }
                    VerificationOutcome::Superseded => Ok(HandshakeResponse::Accepted),
                    VerificationOutcome::Denied(reason) => Err(HubError::VerificationFailed(reason)),
                }
            }
            VerifyMode::Async => {
                let controller = self.controller.clone();
                let log = self.delivery_log.clone();
                tokio::spawn(async move {
                    let topic = params.topic.clone();
                    let callback = params.callback.clone();
                    match run_handshake(&controller, &log, params).await {
                        Ok(outcome) => info!(
                            topic = %topic,
                            callback = %callback,
                            verified = outcome.is_verified(),
                            "Deferred verification finished"
                        ),
                        Err(e) => error!(
                            topic = %topic,
                            callback = %callback,
                            error = %e,
                            "Deferred verification failed"
                        ),
                    }
                });
                Ok(HandshakeResponse::Accepted)
            }
        }
    }

    /// Administrative removal. Drops the subscription's delivery history too.
    pub async fn remove(&self, key: &SubscriptionKey) -> Result<bool, HubError> {
        let removed = self.controller.remove(key).await?;
        self.delivery_log.forget(key).await;
        Ok(removed)
    }

    /// Start delivering `notification` to every active subscriber of its topic.
    /// Summaries are recorded in the delivery log as they arrive.
    pub async fn publish(&self, notification: Notification) -> Result<PublishReceipt, HubError> {
        let topic = notification.topic.clone();
        let subscribers = self.subscribers_for(&topic).await?;
        let subscriber_count = subscribers.len();

        let mut receiver = self.notifier.notify_subscribers(subscribers, notification);
        let log = self.delivery_log.clone();
        tokio::spawn(async move {
            while let Some(summary) = receiver.recv().await {
                log.record(summary).await;
            }
        });

        Ok(PublishReceipt {
            topic,
            subscriber_count,
        })
    }

    /// Deliver and wait for every summary.
    pub async fn publish_and_wait(
        &self,
        notification: Notification,
    ) -> Result<Vec<SubscriptionSummary>, HubError> {
        let subscribers = self.subscribers_for(&notification.topic).await?;
        let summaries = self.notifier.notify_all(subscribers, notification).await;
        for summary in &summaries {
            self.delivery_log.record(summary.clone()).await;
        }
        Ok(summaries)
    }

    async fn subscribers_for(&self, topic: &str) -> Result<Vec<Subscription>, HubError> {
        if topic.trim().is_empty() {
            return Err(ValidationError::EmptyTopic.into());
        }
        for key in self.controller.reap_expired(topic).await? {
            self.delivery_log.forget(&key).await;
        }
        Ok(self.controller.active_subscriptions(topic).await?)
    }
}

async fn run_handshake(
    controller: &LifecycleController,
    log: &DeliveryLog,
    params: HandshakeParams,
) -> Result<VerificationOutcome, LifecycleError> {
    match params.mode {
        Mode::Subscribe => {
            controller
                .subscribe(SubscribeRequest {
                    topic: params.topic,
                    callback: params.callback,
                    lease_seconds: params.lease_seconds,
                    secret: params.secret,
                    verify_token: params.verify_token,
                })
                .await
        }
        Mode::Unsubscribe => {
            let key = SubscriptionKey::new(params.topic.clone(), params.callback.clone());
            let outcome = controller
                .unsubscribe(UnsubscribeRequest {
                    topic: params.topic,
                    callback: params.callback,
                    verify_token: params.verify_token,
                })
                .await?;
            if outcome.is_verified() {
                log.forget(&key).await;
            }
            Ok(outcome)
        }
    }
}
