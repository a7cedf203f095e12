/*
   This module specifies the API by which the protocol engine talks to its collaborators:
   durable storage, the raw transport, and the counterparty of a verification challenge.
*/

use crate::domain::challenge::{Challenge, ChallengeEcho};
use crate::domain::subscription::{Subscription, SubscriptionKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

/// Persistence for subscription records, one record per (topic, callback).
///
/// Implementations need not serialize concurrent writers themselves: the
/// lifecycle controller holds a per-key lock around every read-modify-write.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, key: &SubscriptionKey) -> Result<Option<Subscription>, StoreError>;

    /// Insert or replace the record for `subscription.key()`.
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn remove(&self, key: &SubscriptionKey) -> Result<bool, StoreError>;

    /// Every record for `topic`, in any state.
    async fn list(&self, topic: &str) -> Result<Vec<Subscription>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outbound call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn get(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            endpoint: endpoint.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout,
        }
    }

    pub fn post(endpoint: impl Into<String>, body: impl Into<Bytes>, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            headers: Vec::new(),
            body: body.into(),
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),
}

/// Issues a single request and reads the response. Non-2xx statuses are
/// returned as responses; only failures to complete the exchange are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Error type for a challenge round-trip
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Counterparty refused the challenge with status {status}")]
    Refused { status: u16 },

    #[error("Challenge round-trip failed: {0}")]
    Transport(#[from] TransportError),
}

/// Delivers a challenge to the party that must prove control of the callback
/// endpoint and returns what it echoed back.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, challenge: &Challenge) -> Result<ChallengeEcho, VerifyError>;
}
