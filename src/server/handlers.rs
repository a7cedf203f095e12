pub mod health;
pub mod hub;
pub mod publish;
