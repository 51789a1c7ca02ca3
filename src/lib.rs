// src/lib.rs

pub mod address;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod handoff;
pub mod payload;
pub mod publisher;
pub mod relay;
pub mod retry;
pub mod supervisor;
pub mod topology;

pub use address::{resolve, AddressError, ResolvedAddress};
pub use config::RelayConfig;
pub use errors::{RelayError, Result, Severity};
pub use payload::Payload;
pub use relay::Relay;
