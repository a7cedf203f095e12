use crate::domain::ports::{Method, Transport, TransportError, TransportRequest, TransportResponse};
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Limit on how much of a response body is read.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// `reqwest`-backed transport shared by the requester, verifier and notifier.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(format!("hubbub/{}", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }

    fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_builder() {
            TransportError::InvalidEndpoint(err.to_string())
        } else if err.is_connect() {
            TransportError::Network(err.to_string())
        } else {
            TransportError::RequestFailed(err.to_string())
        }
    }

    async fn read_body(response: Response, timeout: Duration) -> Result<bytes::Bytes, TransportError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(e, timeout))?;

        if bytes.len() > MAX_BODY_SIZE {
            warn!(
                size = bytes.len(),
                max_size = MAX_BODY_SIZE,
                "Response body too large, truncating"
            );
            return Ok(bytes.slice(..MAX_BODY_SIZE));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = reqwest::Url::parse(&request.endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {e}", request.endpoint)))?;

        debug!(method = ?request.method, url = %url, "Sending request");
        let start = Instant::now();

        let mut builder = match request.method {
            Method::Get => self.client.get(url.clone()),
            Method::Post => self.client.post(url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .timeout(request.timeout)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Request failed");
                Self::map_error(e, request.timeout)
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = Self::read_body(response, request.timeout).await?;

        debug!(
            url = %url,
            status = status,
            response_time_ms = start.elapsed().as_millis() as u64,
            "Response received"
        );

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
