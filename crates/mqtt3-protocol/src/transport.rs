use crate::error::MqttError;
use bytes::Bytes;

/// Result of handing one packet to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was accepted.
    Complete,
    /// Only `written` bytes went out; the transport buffered the rest and
    /// reports the drain through `has_pending_writes`.
    Interrupted { written: usize },
    Error(MqttError),
}

impl SendOutcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Non-blocking byte sink for one connection.
///
/// Implementations never wait on the network: a write the socket cannot take
/// right away is buffered and reported as `Interrupted`.
pub trait Transport: Send {
    /// Sends one packet. `header` holds the fixed and variable headers,
    /// `payload` the publish payload (empty for other packets).
    fn send(&mut self, header: Bytes, payload: Bytes) -> SendOutcome;

    fn has_pending_writes(&self) -> bool;

    /// Human-readable peer address for log lines.
    fn peer_description(&self) -> String;

    fn close(&mut self);
}
