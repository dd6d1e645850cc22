//! Transport error taxonomy.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by the resource-manager transport.
///
/// The controller reacts differently to each kind: a clean disconnect is
/// logged and re-subscribed immediately, a transport failure re-subscribes
/// under backoff, and a protocol violation is dropped at the site that
/// observed it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The subscription ended cleanly (manager closed the stream).
    #[error("subscription closed")]
    Disconnected,

    /// Transport-level failure; the registration may still be claimable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer violated the protocol; the offending payload is dropped.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the controller should attempt to re-subscribe.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Transport(_))
    }
}
