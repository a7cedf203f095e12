pub mod lifecycle;
pub mod service;

pub use lifecycle::{
    DenialReason, LifecycleConfig, LifecycleController, LifecycleError, SubscribeRequest,
    UnsubscribeRequest, VerificationOutcome,
};
pub use service::{HandshakeResponse, Hub, HubError, PublishReceipt};
