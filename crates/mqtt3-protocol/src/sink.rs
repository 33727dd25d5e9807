use crate::client::SessionEvent;
use crate::types::{Message, WillMessage};

/// Where the engine hands completed inbound publications and session events.
pub trait MessageSink: Send {
    /// Called exactly once per completed inbound publication.
    fn deliver(&mut self, client_id: &str, message: Message);

    /// Called when a session closes abnormally and has a will configured.
    fn will(&mut self, _client_id: &str, _will: &WillMessage) {}

    fn event(&mut self, _client_id: &str, _event: SessionEvent) {}
}

impl<F> MessageSink for F
where
    F: FnMut(&str, Message) + Send,
{
    fn deliver(&mut self, client_id: &str, message: Message) {
        self(client_id, message);
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl MessageSink for DiscardSink {
    fn deliver(&mut self, _client_id: &str, _message: Message) {}
}
