pub mod config;
pub mod domain;
pub mod hub;
pub mod infrastructure;
pub mod outbound;
pub mod server;
pub mod subscriber;
pub mod telemetry;
pub mod wire;
