//! Subscriber side of the protocol: sending handshakes to a hub and
//! answering the hub's challenges and deliveries.

pub mod registry;
pub mod requester;

pub use registry::{AuthError, ChallengeRefusal, LocalSubscription, SubscriberRegistry};
pub use requester::{
    Dispatch, HubAcknowledgement, HubRequest, PendingRequest, RequestError, RequestReceipt,
    Requester, RequesterConfig,
};
