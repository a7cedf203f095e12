pub mod http_transport;
pub mod memory_store;

pub use http_transport::HttpTransport;
pub use memory_store::InMemorySubscriptionStore;
