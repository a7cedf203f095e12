//! Wire-level handshake parameters.
//!
//! Field names follow the PubSubHubbub `hub.*` convention by default but are
//! grouped in [`ParamNames`] so a deployment can rename them.

use crate::domain::subscription::{Mode, Secret, ValidationError, validate_lease};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamNames {
    pub callback: String,
    pub mode: String,
    pub topic: String,
    pub verify: String,
    pub lease_seconds: String,
    pub secret: String,
    pub verify_token: String,
    pub challenge: String,
    pub signature_header: String,
    pub on_behalf_of_header: String,
}

impl Default for ParamNames {
    fn default() -> Self {
        Self {
            callback: "hub.callback".to_string(),
            mode: "hub.mode".to_string(),
            topic: "hub.topic".to_string(),
            verify: "hub.verify".to_string(),
            lease_seconds: "hub.lease_seconds".to_string(),
            secret: "hub.secret".to_string(),
            verify_token: "hub.verify_token".to_string(),
            challenge: "hub.challenge".to_string(),
            signature_header: "X-Hub-Signature".to_string(),
            on_behalf_of_header: "X-Hub-On-Behalf-Of".to_string(),
        }
    }
}

/// Whether the hub verifies before answering the handshake or afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    Sync,
    Async,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::Sync => "sync",
            VerifyMode::Async => "async",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("missing parameter {0}")]
    Missing(String),

    #[error("unsupported value {value:?} for {name}")]
    Unsupported { name: String, value: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Parse a lease value as sent on the wire.
pub fn parse_lease(raw: &str) -> Result<u32, ValidationError> {
    let seconds: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidLease(raw.to_string()))?;
    validate_lease(seconds)
}

pub fn parse_mode(raw: &str) -> Option<Mode> {
    match raw {
        "subscribe" => Some(Mode::Subscribe),
        "unsubscribe" => Some(Mode::Unsubscribe),
        _ => None,
    }
}

/// A subscribe or unsubscribe request as carried by the handshake call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub topic: String,
    pub callback: String,
    pub mode: Mode,
    pub verify: VerifyMode,
    pub lease_seconds: Option<u32>,
    pub secret: Option<Secret>,
    pub verify_token: Option<String>,
}

impl HandshakeParams {
    /// Parse a decoded form body, keeping every pair. Repeated `hub.verify`
    /// values are joined in order; for any other field the first value wins.
    pub fn from_pairs(
        pairs: Vec<(String, String)>,
        names: &ParamNames,
    ) -> Result<Self, WireError> {
        let mut form: HashMap<String, String> = HashMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            match form.get_mut(&name) {
                Some(joined) if name == names.verify => {
                    joined.push(',');
                    joined.push_str(&value);
                }
                Some(_) => {}
                None => {
                    form.insert(name, value);
                }
            }
        }
        Self::from_form(&form, names)
    }

    /// Parse form fields. `hub.verify` may be repeated or comma separated;
    /// the first recognised value wins and `sync` is assumed when none is.
    pub fn from_form(
        form: &HashMap<String, String>,
        names: &ParamNames,
    ) -> Result<Self, WireError> {
        let required = |name: &String| -> Result<String, WireError> {
            form.get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| WireError::Missing(name.clone()))
        };

        let topic = required(&names.topic)?;
        let callback = required(&names.callback)?;
        let raw_mode = required(&names.mode)?;
        let mode = parse_mode(&raw_mode).ok_or_else(|| WireError::Unsupported {
            name: names.mode.clone(),
            value: raw_mode.clone(),
        })?;

        let verify = form
            .get(&names.verify)
            .and_then(|raw| {
                raw.split(',').find_map(|v| match v.trim() {
                    "sync" => Some(VerifyMode::Sync),
                    "async" => Some(VerifyMode::Async),
                    _ => None,
                })
            })
            .unwrap_or_default();

        let lease_seconds = match (mode, form.get(&names.lease_seconds)) {
            (Mode::Subscribe, Some(raw)) if !raw.is_empty() => Some(parse_lease(raw)?),
            _ => None,
        };

        let secret = match (mode, form.get(&names.secret)) {
            (Mode::Subscribe, Some(raw)) if !raw.is_empty() => Some(Secret::new(raw.clone())?),
            _ => None,
        };

        let verify_token = form
            .get(&names.verify_token)
            .filter(|v| !v.is_empty())
            .cloned();

        Ok(Self {
            topic,
            callback,
            mode,
            verify,
            lease_seconds,
            secret,
            verify_token,
        })
    }

    /// Form fields for the handshake call. Lease and secret are only sent on subscribe.
    pub fn to_form(&self, names: &ParamNames) -> Vec<(String, String)> {
        let mut pairs = vec![
            (names.callback.clone(), self.callback.clone()),
            (names.mode.clone(), self.mode.as_str().to_string()),
            (names.topic.clone(), self.topic.clone()),
            (names.verify.clone(), self.verify.as_str().to_string()),
        ];
        if self.mode == Mode::Subscribe {
            if let Some(lease) = self.lease_seconds {
                pairs.push((names.lease_seconds.clone(), lease.to_string()));
            }
            if let Some(secret) = &self.secret {
                pairs.push((names.secret.clone(), secret.expose().to_string()));
            }
        }
        if let Some(token) = &self.verify_token {
            pairs.push((names.verify_token.clone(), token.clone()));
        }
        pairs
    }
}
