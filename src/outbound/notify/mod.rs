// Hub-side notification delivery
//
//   signature    – HMAC-SHA256 payload signing and verification
//   notifier     – concurrent fan-out to subscriber callbacks
//   schemas      – notification and per-subscriber summary types
//   delivery_log – bounded per-subscription delivery history

pub mod delivery_log;
pub mod notifier;
pub mod schemas;
pub mod signature;

// Re-export commonly used types
pub use delivery_log::DeliveryLog;
pub use notifier::{Notifier, NotifierConfig, SummaryReceiver};
pub use schemas::{DeliveryOutcome, Notification, SubscriptionSummary};
pub use signature::{
    PayloadSigner, SignatureError, format_signature_header, parse_signature_header,
};
