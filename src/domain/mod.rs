pub mod challenge;
pub mod ports;
pub mod subscription;

pub use challenge::{
    Challenge, ChallengeEcho, ChallengeParams, Confirmation, RejectReason, TokenSource,
    VerificationHandler,
};
pub use ports::{
    Method, StoreError, SubscriptionStore, Transport, TransportError, TransportRequest,
    TransportResponse, Verifier, VerifyError,
};
pub use subscription::{
    Mode, PendingVerification, Secret, Subscriber, Subscription, SubscriptionKey,
    SubscriptionState, TransitionError, ValidationError, validate_lease,
};
