use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix naming the algorithm in the signature header value.
pub const SIGNATURE_SCHEME: &str = "sha256";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Invalid signature header format: {0}")]
    MalformedHeader(String),

    #[error("Signature is not valid hex")]
    NotHex,

    #[error("Invalid signature")]
    Mismatch,
}

/// HMAC-SHA256 over raw payload bytes, keyed by a subscription secret.
pub struct PayloadSigner {
    secret: Vec<u8>,
}

impl PayloadSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC key can be of any size, as per crate documentation"),
        }
    }

    /// Hex-encoded signature of `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex signature against `payload`.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<(), SignatureError> {
        let expected = hex::decode(signature).map_err(|_| SignatureError::NotHex)?;
        let mut mac = self.mac();
        mac.update(payload);
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Check a full header value such as `sha256=ab12…`.
    pub fn verify_header(&self, payload: &[u8], header: &str) -> Result<(), SignatureError> {
        let signature = parse_signature_header(header)?;
        self.verify(payload, &signature)
    }
}

/// Format a signature for the signature header.
pub fn format_signature_header(signature: &str) -> String {
    format!("{SIGNATURE_SCHEME}={signature}")
}

/// Extract the hex signature from a header value.
pub fn parse_signature_header(header: &str) -> Result<String, SignatureError> {
    header
        .trim()
        .strip_prefix(SIGNATURE_SCHEME)
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::to_string)
        .ok_or_else(|| SignatureError::MalformedHeader(header.to_string()))
}
