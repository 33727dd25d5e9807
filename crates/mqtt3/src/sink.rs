//! Sinks for the tokio runtime.

use mqtt3_protocol::client::SessionEvent;
use mqtt3_protocol::types::{Message, WillMessage};
use tokio::sync::mpsc;
use tracing::trace;

pub use mqtt3_protocol::sink::{DiscardSink, MessageSink};

/// Everything the engine reports, tagged with the session it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Message { client_id: String, message: Message },
    Will { client_id: String, will: WillMessage },
    Session { client_id: String, event: SessionEvent },
}

impl SinkEvent {
    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::Message { client_id, .. }
            | Self::Will { client_id, .. }
            | Self::Session { client_id, .. } => client_id,
        }
    }
}

/// Forwards engine output over an unbounded channel so the engine lock is
/// never held while application code runs.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            trace!("Sink receiver dropped, discarding event");
        }
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&mut self, client_id: &str, message: Message) {
        self.forward(SinkEvent::Message {
            client_id: client_id.to_string(),
            message,
        });
    }

    fn will(&mut self, client_id: &str, will: &WillMessage) {
        self.forward(SinkEvent::Will {
            client_id: client_id.to_string(),
            will: will.clone(),
        });
    }

    fn event(&mut self, client_id: &str, event: SessionEvent) {
        self.forward(SinkEvent::Session {
            client_id: client_id.to_string(),
            event,
        });
    }
}
