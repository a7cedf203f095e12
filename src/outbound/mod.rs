pub mod notify;
pub mod verify;

pub use verify::HttpVerifier;
