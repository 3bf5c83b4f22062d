//! Error taxonomy for call signaling.

use thiserror::Error;

pub type Result<T, E = CallError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CallError {
    /// A precondition on session or identity state does not hold.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no peer session registered for {0}")]
    UnknownPeer(String),

    #[error("a live peer session already exists for {0}")]
    DuplicateSubscription(String),

    /// Informational: the join was buffered until the local publish completes.
    #[error("publisher not ready, join from {0} buffered")]
    PublisherNotReady(String),

    #[error("unrecognized event type: {0}")]
    UnrecognizedEvent(String),

    #[error("event is missing required field: {0}")]
    MalformedEvent(&'static str),

    #[error("invalid local media: {0}")]
    InvalidMedia(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Retry budget exhausted while polling for events.
    #[error("connection to the signaling server lost")]
    ConnectionLost,
}

impl CallError {
    /// Failures that do not indicate anything went wrong, only that work was deferred.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::PublisherNotReady(_))
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        Self::TransportFailure(err.to_string())
    }
}

impl From<ureq::Error> for CallError {
    fn from(err: ureq::Error) -> Self {
        Self::NetworkFailure(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CallError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::NetworkFailure(format!("request task failed: {err}"))
    }
}
