use crate::domain::ports::{Transport, TransportError, TransportRequest};
use crate::domain::subscription::Subscription;
use crate::outbound::notify::schemas::{Notification, SubscriptionSummary};
use crate::outbound::notify::signature::{PayloadSigner, format_signature_header};
use crate::wire::ParamNames;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Upper bound on a single delivery, including any wait for a permit
    /// and reading the response.
    pub delivery_timeout: Duration,

    /// Deliveries allowed in flight across all calls. `None` (the default)
    /// means unbounded. With a bound, deliveries queued behind slow
    /// callbacks can time out while waiting.
    pub max_concurrent: Option<usize>,

    /// Advertised as `Link: <…>; rel="hub"` when set.
    pub hub_url: Option<String>,

    pub names: ParamNames,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(30),
            max_concurrent: None,
            hub_url: None,
            names: ParamNames::default(),
        }
    }
}

/// Yields one [`SubscriptionSummary`] per subscriber handed to
/// [`Notifier::notify_subscribers`], in completion order.
pub struct SummaryReceiver {
    rx: mpsc::UnboundedReceiver<SubscriptionSummary>,
    expected: usize,
}

impl SummaryReceiver {
    /// Number of summaries this receiver will yield.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Next completed delivery, or `None` once every delivery has reported.
    pub async fn recv(&mut self) -> Option<SubscriptionSummary> {
        self.rx.recv().await
    }

    /// Wait for every delivery and return all summaries.
    pub async fn collect(mut self) -> Vec<SubscriptionSummary> {
        let mut summaries = Vec::with_capacity(self.expected);
        while let Some(summary) = self.rx.recv().await {
            summaries.push(summary);
        }
        summaries
    }
}

/// Hub-side fan-out: pushes a notification to every subscriber independently.
///
/// Each delivery runs as its own task with its own timeout, so a slow or
/// failing subscriber never holds up the others. Every subscriber yields
/// exactly one summary, even if its delivery task panics.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn Transport>,
    config: Arc<NotifierConfig>,
    limiter: Option<Arc<Semaphore>>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn Transport>, config: NotifierConfig) -> Self {
        let limiter = config
            .max_concurrent
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Self {
            transport,
            config: Arc::new(config),
            limiter,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Start delivering and return immediately. Must be called inside a Tokio runtime.
    pub fn notify_subscribers(
        &self,
        subscribers: Vec<Subscription>,
        notification: Notification,
    ) -> SummaryReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let expected = subscribers.len();
        let notification = Arc::new(notification);

        if expected > 0 {
            info!(
                topic = %notification.topic,
                subscriber_count = expected,
                "Notifying subscribers"
            );
        }

        for subscription in subscribers {
            let notifier = self.clone();
            let notification = notification.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let delivery = AssertUnwindSafe(notifier.deliver(&subscription, &notification));
                let summary = match delivery.catch_unwind().await {
                    Ok(summary) => summary,
                    Err(_) => {
                        error!(
                            callback = %subscription.callback(),
                            "Delivery task panicked"
                        );
                        SubscriptionSummary::failed(
                            &notification.topic,
                            &subscription.subscriber,
                            None,
                            "delivery task panicked".to_string(),
                        )
                    }
                };

                if tx.send(summary).is_err() {
                    debug!(
                        callback = %subscription.callback(),
                        "Summary receiver dropped"
                    );
                }
            });
        }

        SummaryReceiver { rx, expected }
    }

    /// Deliver to everyone and wait for all summaries.
    pub async fn notify_all(
        &self,
        subscribers: Vec<Subscription>,
        notification: Notification,
    ) -> Vec<SubscriptionSummary> {
        self.notify_subscribers(subscribers, notification)
            .collect()
            .await
    }

    /// Deliver to everyone, invoking `on_each` once per summary from a single
    /// task. The returned handle completes after the last invocation.
    pub fn notify_with<F>(
        &self,
        subscribers: Vec<Subscription>,
        notification: Notification,
        mut on_each: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(SubscriptionSummary) + Send + 'static,
    {
        let mut receiver = self.notify_subscribers(subscribers, notification);
        tokio::spawn(async move {
            while let Some(summary) = receiver.recv().await {
                on_each(summary);
            }
        })
    }

    async fn deliver(
        &self,
        subscription: &Subscription,
        notification: &Notification,
    ) -> SubscriptionSummary {
        let topic = notification.topic.as_str();
        let subscriber = &subscription.subscriber;

        let request = self.build_request(subscription, notification);
        let timeout = self.config.delivery_timeout;
        let start = Instant::now();

        let attempt = async {
            let _permit = match &self.limiter {
                Some(limiter) => Some(
                    limiter
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| TransportError::RequestFailed(e.to_string()))?,
                ),
                None => None,
            };
            self.transport.send(request).await
        };

        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let on_behalf_of = response
                    .header(&self.config.names.on_behalf_of_header)
                    .and_then(|v| v.trim().parse::<u32>().ok());

                if response.is_success() {
                    debug!(
                        topic = %topic,
                        callback = %subscriber.callback,
                        status_code = response.status,
                        response_time_ms = response_time_ms,
                        "Notification delivered"
                    );
                    SubscriptionSummary::delivered(
                        topic,
                        subscriber,
                        response.status,
                        response_time_ms,
                    )
                    .with_on_behalf_of(on_behalf_of)
                } else {
                    warn!(
                        topic = %topic,
                        callback = %subscriber.callback,
                        status_code = response.status,
                        "Subscriber rejected notification"
                    );
                    SubscriptionSummary::failed(
                        topic,
                        subscriber,
                        Some(response.status),
                        format!("status={}, body={}", response.status, response.body_text()),
                    )
                    .with_on_behalf_of(on_behalf_of)
                }
            }
            Err(TransportError::Timeout(after)) => {
                warn!(
                    topic = %topic,
                    callback = %subscriber.callback,
                    "Notification timed out"
                );
                SubscriptionSummary::timed_out(
                    topic,
                    subscriber,
                    TransportError::Timeout(after).to_string(),
                )
            }
            Err(e) => {
                warn!(
                    topic = %topic,
                    callback = %subscriber.callback,
                    error = %e,
                    "Notification failed"
                );
                SubscriptionSummary::failed(topic, subscriber, None, e.to_string())
            }
        }
    }

    fn build_request(
        &self,
        subscription: &Subscription,
        notification: &Notification,
    ) -> TransportRequest {
        let mut links = Vec::with_capacity(2);
        if let Some(hub) = &self.config.hub_url {
            links.push(format!("<{hub}>; rel=\"hub\""));
        }
        links.push(format!("<{}>; rel=\"self\"", notification.topic));

        let mut request = TransportRequest::post(
            subscription.callback(),
            notification.payload.clone(),
            self.config.delivery_timeout,
        )
        .header("Content-Type", notification.content_type.clone())
        .header("Link", links.join(", "));

        if let Some(secret) = &subscription.secret {
            let signature = PayloadSigner::new(secret.expose()).sign(&notification.payload);
            request = request.header(
                self.config.names.signature_header.clone(),
                format_signature_header(&signature),
            );
        }
        request
    }
}
