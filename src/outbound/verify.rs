use crate::domain::challenge::{Challenge, ChallengeEcho};
use crate::domain::ports::{Transport, TransportError, TransportRequest, Verifier, VerifyError};
use crate::wire::ParamNames;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sends the challenge to the callback endpoint as a GET and reads the echo
/// from the response body.
///
/// Callbacks only echo the challenge token; topic, mode and lease are taken
/// from the request the callback acknowledged.
pub struct HttpVerifier {
    transport: Arc<dyn Transport>,
    names: ParamNames,
    timeout: Duration,
}

impl HttpVerifier {
    pub fn new(transport: Arc<dyn Transport>, names: ParamNames, timeout: Duration) -> Self {
        Self {
            transport,
            names,
            timeout,
        }
    }

    /// Callback URL with the challenge query appended to any existing query.
    pub fn challenge_url(&self, challenge: &Challenge) -> Result<String, TransportError> {
        let params = &challenge.params;
        let mut query = vec![
            (self.names.mode.as_str(), params.mode.as_str().to_string()),
            (self.names.topic.as_str(), params.topic.clone()),
            (self.names.challenge.as_str(), challenge.token.clone()),
        ];
        if let Some(lease) = params.lease_seconds {
            query.push((self.names.lease_seconds.as_str(), lease.to_string()));
        }
        if let Some(token) = &params.verify_token {
            query.push((self.names.verify_token.as_str(), token.clone()));
        }

        reqwest::Url::parse_with_params(&params.callback, &query)
            .map(String::from)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {e}", params.callback)))
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, challenge: &Challenge) -> Result<ChallengeEcho, VerifyError> {
        let url = self.challenge_url(challenge)?;
        debug!(
            callback = %challenge.params.callback,
            topic = %challenge.params.topic,
            mode = %challenge.params.mode,
            "Sending verification challenge"
        );

        let response = self
            .transport
            .send(TransportRequest::get(url, self.timeout))
            .await?;

        if !response.is_success() {
            warn!(
                callback = %challenge.params.callback,
                status = response.status,
                "Callback refused verification"
            );
            return Err(VerifyError::Refused {
                status: response.status,
            });
        }

        Ok(ChallengeEcho {
            token: response.body_text().trim().to_string(),
            topic: challenge.params.topic.clone(),
            mode: challenge.params.mode,
            lease_seconds: challenge.params.lease_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::challenge::ChallengeParams;
    use crate::domain::ports::TransportResponse;
    use crate::domain::subscription::Mode;
    use tokio::sync::Mutex;

    struct EchoTransport {
        status: u16,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().await.push(request.endpoint.clone());
            let url = reqwest::Url::parse(&request.endpoint)
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
            let token = url
                .query_pairs()
                .find(|(k, _)| k == "hub.challenge")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            Ok(TransportResponse::new(self.status, format!("{token}\n")))
        }
    }

    fn challenge(callback: &str) -> Challenge {
        Challenge {
            token: "tok-1".to_string(),
            params: ChallengeParams {
                topic: "feed:42".to_string(),
                callback: callback.to_string(),
                mode: Mode::Subscribe,
                lease_seconds: Some(3600),
                verify_token: Some("vt".to_string()),
            },
        }
    }

    fn verifier(status: u16) -> (Arc<EchoTransport>, HttpVerifier) {
        let transport = Arc::new(EchoTransport {
            status,
            seen: Mutex::new(Vec::new()),
        });
        let verifier = HttpVerifier::new(
            transport.clone(),
            ParamNames::default(),
            Duration::from_secs(5),
        );
        (transport, verifier)
    }

    #[tokio::test]
    async fn test_echo_is_read_from_body() -> Result<(), VerifyError> {
        let (transport, verifier) = verifier(200);
        let challenge = challenge("https://sub.example/cb?id=7");

        let echo = verifier.verify(&challenge).await?;
        assert_eq!(echo, ChallengeEcho::of(&challenge));

        let seen = transport.seen.lock().await;
        assert!(seen[0].starts_with("https://sub.example/cb?id=7&hub.mode=subscribe"));
        assert!(seen[0].contains("hub.lease_seconds=3600"));
        assert!(seen[0].contains("hub.verify_token=vt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_non_success_is_a_refusal() {
        let (_, verifier) = verifier(404);
        let err = verifier
            .verify(&challenge("https://sub.example/cb"))
            .await
            .unwrap_err();
        assert_eq!(err, VerifyError::Refused { status: 404 });
    }

    #[test]
    fn test_invalid_callback() {
        let (_, verifier) = verifier(200);
        assert!(matches!(
            verifier.challenge_url(&challenge("not a url")),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}
