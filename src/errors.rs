// src/errors.rs

use lapin::Error as LapinError;
use std::path::PathBuf;
use thiserror::Error;

use crate::address::AddressError;

/// How a failure is handled by the component that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Misconfiguration; the process terminates.
    Fatal,
    /// Connection-level trouble; handled by reconnecting and retrying.
    Transient,
    /// A single bad message; rejected and never retried.
    Protocol,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("RabbitMQ connection error: {0}")]
    Dial(String),

    #[error("RabbitMQ channel could not be opened: {0}")]
    ChannelOpen(String),

    #[error("Failed to declare {artifact}: {reason}")]
    Topology { artifact: String, reason: String },

    #[error("RabbitMQ consume error: {0}")]
    Consume(String),

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(String),

    #[error("Invalid reply-to: {0}")]
    ReplyTo(#[from] AddressError),

    #[error("Failed to read payload file {}: {source}", path.display())]
    Payload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<RelayError>,
    },

    #[error("Connection supervisor is no longer running")]
    SupervisorGone,

    #[error("Reply publisher is no longer running")]
    PublisherGone,

    #[error("{0} task stopped unexpectedly")]
    TaskStopped(&'static str),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn severity(&self) -> Severity {
        match self {
            RelayError::Dial(_)
            | RelayError::Consume(_)
            | RelayError::Publish(_)
            | RelayError::Ack(_) => Severity::Transient,
            RelayError::ReplyTo(_) => Severity::Protocol,
            RelayError::ChannelOpen(_)
            | RelayError::Topology { .. }
            | RelayError::Payload { .. }
            | RelayError::Config(_)
            | RelayError::RetriesExhausted { .. }
            | RelayError::SupervisorGone
            | RelayError::PublisherGone
            | RelayError::TaskStopped(_) => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

// Only the dial path converts implicitly; every other lapin call site maps
// its error into the variant describing what it was doing.
impl From<LapinError> for RelayError {
    fn from(error: LapinError) -> Self {
        RelayError::Dial(error.to_string())
    }
}
