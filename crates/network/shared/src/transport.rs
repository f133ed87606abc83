//! Minimal contract the session layer needs from a transport connection.
//!
//! The real socket machinery (accept loops, codecs, flushing) lives outside
//! this layer and exposes each connection as a [`Channel`].

use std::sync::Arc;

use thiserror::Error;

use crate::envelope::Envelope;

/// Transport level error surfaced to the session layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

/// One bidirectional connection as seen by a session.
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queues one envelope for delivery. Calls made from one thread are
    /// written in call order; cross-thread ordering is the caller's concern.
    fn write(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Writes one final envelope and closes once delivery completes. Used
    /// for kick messages; delivery failures only accelerate the close.
    fn write_then_close(&self, envelope: Envelope) {
        let _ = self.write(envelope);
        self.close();
    }

    fn close(&self);

    /// Human readable peer address for logs.
    fn peer_label(&self) -> String;
}

/// Shared handle to a channel; sessions and the send pool clone this freely.
pub type SharedChannel = Arc<dyn Channel>;
