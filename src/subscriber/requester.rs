use crate::domain::ports::{Transport, TransportError, TransportRequest};
use crate::domain::subscription::{Mode, Secret, ValidationError};
use crate::hub::lifecycle::validate_key;
use crate::wire::{HandshakeParams, ParamNames, VerifyMode};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Where a handshake call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// On the caller's task; the result is known when the call returns.
    #[default]
    Inline,
    /// On its own Tokio task; the call returns immediately.
    Spawned,
}

#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Bound on the handshake call, including the hub's own verification when sync.
    pub timeout: Duration,
    pub dispatch: Dispatch,
    /// Permit sending a secret to a plain `http` hub. Local testing only.
    pub allow_insecure_secret: bool,
    pub names: ParamNames,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            dispatch: Dispatch::Inline,
            allow_insecure_secret: false,
            names: ParamNames::default(),
        }
    }
}

/// One subscribe or unsubscribe call against a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRequest {
    pub hub: String,
    pub topic: String,
    pub callback: String,
    pub mode: Mode,
    pub lease_seconds: Option<u32>,
    pub secret: Option<Secret>,
    pub verify: VerifyMode,
    pub verify_token: Option<String>,
}

impl HubRequest {
    pub fn subscribe(
        hub: impl Into<String>,
        topic: impl Into<String>,
        callback: impl Into<String>,
    ) -> Self {
        Self {
            hub: hub.into(),
            topic: topic.into(),
            callback: callback.into(),
            mode: Mode::Subscribe,
            lease_seconds: None,
            secret: None,
            verify: VerifyMode::Sync,
            verify_token: None,
        }
    }

    pub fn unsubscribe(
        hub: impl Into<String>,
        topic: impl Into<String>,
        callback: impl Into<String>,
    ) -> Self {
        Self {
            mode: Mode::Unsubscribe,
            ..Self::subscribe(hub, topic, callback)
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

    pub fn with_verify(mut self, verify: VerifyMode) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_verify_token(mut self, token: impl Into<String>) -> Self {
        self.verify_token = Some(token.into());
        self
    }

    fn params(&self) -> HandshakeParams {
        HandshakeParams {
            topic: self.topic.clone(),
            callback: self.callback.clone(),
            mode: self.mode,
            verify: self.verify,
            lease_seconds: self.lease_seconds,
            secret: self.secret.clone(),
            verify_token: self.verify_token.clone(),
        }
    }
}

/// What the hub said about an accepted handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubAcknowledgement {
    /// `204`: the hub already verified the callback.
    Verified,
    /// Any other 2xx: verification will happen later.
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReceipt {
    pub topic: String,
    pub mode: Mode,
    pub status: u16,
    pub acknowledgement: HubAcknowledgement,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Invalid hub endpoint: {0}")]
    InvalidHub(String),

    #[error("Refusing to send a secret to non-https hub {0}")]
    InsecureSecret(String),

    #[error("Failed to encode handshake: {0}")]
    Encoding(String),

    #[error("Hub rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Handshake task aborted: {0}")]
    Aborted(String),
}

/// A handshake that may still be running.
#[derive(Debug)]
pub enum PendingRequest {
    Ready(Result<RequestReceipt, RequestError>),
    Spawned(JoinHandle<Result<RequestReceipt, RequestError>>),
}

impl PendingRequest {
    pub async fn outcome(self) -> Result<RequestReceipt, RequestError> {
        match self {
            PendingRequest::Ready(result) => result,
            PendingRequest::Spawned(handle) => handle
                .await
                .unwrap_or_else(|e| Err(RequestError::Aborted(e.to_string()))),
        }
    }
}

/// Subscriber-side handshake driver.
///
/// Sends exactly one form-encoded call per request and never retries.
/// Transport failures and non-2xx answers come back as [`RequestError`].
#[derive(Clone)]
pub struct Requester {
    transport: Arc<dyn Transport>,
    config: Arc<RequesterConfig>,
}

impl Requester {
    pub fn new(transport: Arc<dyn Transport>, config: RequesterConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.config
    }

    /// Check the request and build the form body.
    pub fn prepare(&self, request: &HubRequest) -> Result<TransportRequest, RequestError> {
        validate_key(&request.topic, &request.callback)?;

        let hub = reqwest::Url::parse(&request.hub)
            .map_err(|e| RequestError::InvalidHub(format!("{}: {e}", request.hub)))?;
        if !matches!(hub.scheme(), "http" | "https") {
            return Err(RequestError::InvalidHub(request.hub.clone()));
        }
        if request.mode == Mode::Subscribe
            && request.secret.is_some()
            && hub.scheme() != "https"
            && !self.config.allow_insecure_secret
        {
            return Err(RequestError::InsecureSecret(request.hub.clone()));
        }

        let body = serde_urlencoded::to_string(request.params().to_form(&self.config.names))
            .map_err(|e| RequestError::Encoding(e.to_string()))?;

        Ok(
            TransportRequest::post(hub.to_string(), body, self.config.timeout)
                .header("Content-Type", FORM_CONTENT_TYPE),
        )
    }

    /// Send the handshake on the caller's task.
    pub async fn send(&self, request: &HubRequest) -> Result<RequestReceipt, RequestError> {
        let call = self.prepare(request)?;
        self.execute(request, call).await
    }

    /// Dispatch according to the configured [`Dispatch`]. Contract violations
    /// are returned before anything is sent.
    pub async fn request(&self, request: HubRequest) -> Result<PendingRequest, RequestError> {
        let call = self.prepare(&request)?;
        match self.config.dispatch {
            Dispatch::Inline => Ok(PendingRequest::Ready(self.execute(&request, call).await)),
            Dispatch::Spawned => {
                let requester = self.clone();
                Ok(PendingRequest::Spawned(tokio::spawn(async move {
                    requester.execute_guarded(&request, call).await
                })))
            }
        }
    }

    /// Like [`Requester::request`], reporting the result through `on_result`.
    ///
    /// `on_result` runs exactly once: before this returns when inline, from the
    /// spawned task otherwise. It is not called when the request is rejected
    /// up front.
    pub async fn request_with<F>(&self, request: HubRequest, on_result: F) -> Result<(), RequestError>
    where
        F: FnOnce(Result<RequestReceipt, RequestError>) + Send + 'static,
    {
        let call = self.prepare(&request)?;
        match self.config.dispatch {
            Dispatch::Inline => on_result(self.execute_guarded(&request, call).await),
            Dispatch::Spawned => {
                let requester = self.clone();
                tokio::spawn(async move {
                    on_result(requester.execute_guarded(&request, call).await);
                });
            }
        }
        Ok(())
    }

    async fn execute_guarded(
        &self,
        request: &HubRequest,
        call: TransportRequest,
    ) -> Result<RequestReceipt, RequestError> {
        match AssertUnwindSafe(self.execute(request, call)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(hub = %request.hub, topic = %request.topic, "Handshake task panicked");
                Err(RequestError::Aborted("handshake task panicked".to_string()))
            }
        }
    }

    async fn execute(
        &self,
        request: &HubRequest,
        call: TransportRequest,
    ) -> Result<RequestReceipt, RequestError> {
        debug!(
            hub = %request.hub,
            topic = %request.topic,
            callback = %request.callback,
            mode = %request.mode,
            verify = request.verify.as_str(),
            "Sending handshake"
        );

        let timeout = self.config.timeout;
        let response = match tokio::time::timeout(timeout, self.transport.send(call)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(hub = %request.hub, topic = %request.topic, error = %e, "Handshake failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(hub = %request.hub, topic = %request.topic, "Handshake timed out");
                return Err(TransportError::Timeout(timeout).into());
            }
        };

        if !response.is_success() {
            warn!(
                hub = %request.hub,
                topic = %request.topic,
                status_code = response.status,
                "Hub rejected handshake"
            );
            return Err(RequestError::Rejected {
                status: response.status,
                body: response.body_text(),
            });
        }

        let acknowledgement = if response.status == 204 {
            HubAcknowledgement::Verified
        } else {
            HubAcknowledgement::Accepted
        };
        info!(
            hub = %request.hub,
            topic = %request.topic,
            mode = %request.mode,
            status_code = response.status,
            "Handshake acknowledged"
        );

        Ok(RequestReceipt {
            topic: request.topic.clone(),
            mode: request.mode,
            status: response.status,
            acknowledgement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::TransportResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, oneshot};

    struct Scripted {
        result: Result<TransportResponse, TransportError>,
        calls: AtomicUsize,
        bodies: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(result: Result<TransportResponse, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
                bodies: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies
                .lock()
                .await
                .push(String::from_utf8_lossy(&request.body).into_owned());
            self.result.clone()
        }
    }

    fn requester(transport: Arc<Scripted>, dispatch: Dispatch) -> Requester {
        Requester::new(
            transport,
            RequesterConfig {
                dispatch,
                ..RequesterConfig::default()
            },
        )
    }

    fn request() -> HubRequest {
        HubRequest::subscribe("https://hub.example/", "feed:42", "https://sub.example/cb")
            .with_lease(3600)
    }

    #[tokio::test]
    async fn test_no_content_means_verified() -> Result<(), RequestError> {
        let transport = Scripted::new(Ok(TransportResponse::new(204, "")));
        let receipt = requester(transport.clone(), Dispatch::Inline)
            .send(&request())
            .await?;

        assert_eq!(receipt.acknowledgement, HubAcknowledgement::Verified);
        let bodies = transport.bodies.lock().await;
        assert!(bodies[0].contains("hub.mode=subscribe"));
        assert!(bodies[0].contains("hub.topic=feed%3A42"));
        assert!(bodies[0].contains("hub.lease_seconds=3600"));
        Ok(())
    }

    #[tokio::test]
    async fn test_accepted_and_rejected() {
        let transport = Scripted::new(Ok(TransportResponse::new(202, "")));
        let receipt = requester(transport, Dispatch::Inline)
            .send(&request())
            .await
            .unwrap();
        assert_eq!(receipt.acknowledgement, HubAcknowledgement::Accepted);

        let transport = Scripted::new(Ok(TransportResponse::new(409, "denied")));
        let err = requester(transport.clone(), Dispatch::Inline)
            .send(&request())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RequestError::Rejected {
                status: 409,
                body: "denied".to_string()
            }
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let transport = Scripted::new(Err(TransportError::Network("refused".to_string())));
        let pending = requester(transport.clone(), Dispatch::Spawned)
            .request(request())
            .await
            .unwrap();

        assert!(matches!(
            pending.outcome().await,
            Err(RequestError::Transport(TransportError::Network(_)))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_secret_requires_https() {
        let transport = Scripted::new(Ok(TransportResponse::new(204, "")));
        let secret = Secret::new("s3cret").unwrap();
        let insecure = HubRequest::subscribe("http://hub.example/", "feed:42", "https://sub.example/cb")
            .with_secret(secret.clone());

        let err = requester(transport.clone(), Dispatch::Inline)
            .send(&insecure)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InsecureSecret(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let permissive = Requester::new(
            transport.clone(),
            RequesterConfig {
                allow_insecure_secret: true,
                ..RequesterConfig::default()
            },
        );
        assert!(permissive.send(&insecure).await.is_ok());
        assert!(transport.bodies.lock().await[0].contains("hub.secret=s3cret"));
    }

    #[tokio::test]
    async fn test_unsubscribe_omits_lease_and_secret() -> Result<(), RequestError> {
        let transport = Scripted::new(Ok(TransportResponse::new(204, "")));
        let unsubscribe =
            HubRequest::unsubscribe("https://hub.example/", "feed:42", "https://sub.example/cb")
                .with_lease(60);
        requester(transport.clone(), Dispatch::Inline)
            .send(&unsubscribe)
            .await?;

        let bodies = transport.bodies.lock().await;
        assert!(bodies[0].contains("hub.mode=unsubscribe"));
        assert!(!bodies[0].contains("hub.lease_seconds"));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_hub_is_rejected_up_front() {
        let transport = Scripted::new(Ok(TransportResponse::new(204, "")));
        let bad = HubRequest::subscribe("ftp://hub.example/", "feed:42", "https://sub.example/cb");
        let err = requester(transport.clone(), Dispatch::Spawned)
            .request(bad)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidHub(_)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_on_result_runs_once_inline() {
        let transport = Scripted::new(Ok(TransportResponse::new(204, "")));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        requester(transport, Dispatch::Inline)
            .request_with(request(), move |result| {
                assert!(result.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_result_runs_once_spawned() {
        let transport = Scripted::new(Err(TransportError::Timeout(Duration::from_secs(1))));
        let (tx, rx) = oneshot::channel();

        requester(transport, Dispatch::Spawned)
            .request_with(request(), move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(
            result,
            Err(RequestError::Transport(TransportError::Timeout(_)))
        ));
    }
}
