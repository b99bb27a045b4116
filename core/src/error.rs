//! Error types for the conversation synchronizer
use thiserror::Error;

/// Failures of the push channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is not `Open`; nothing was written
    #[error("push channel is not connected")]
    NotConnected,

    /// The link dropped while a frame was in flight
    #[error("push channel connection lost: {0}")]
    ConnectionLost(String),
}

/// Failures of a pull request against the message store service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network trouble, timeouts, 5xx; retrying may succeed
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// The service rejected the request (unknown peer, bad body, ...)
    #[error("permanent fetch error: {0}")]
    Permanent(String),

    /// The caller cancelled the request; the result must not be applied
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Input rejected before any state change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("peer name is empty")]
    EmptyPeer,
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Unknown local message: {0}")]
    UnknownMessage(uuid::Uuid),
}

pub type Result<T> = std::result::Result<T, ChatError>;
