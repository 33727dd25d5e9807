use crate::error::Result;
use crate::packet_id::PacketIdCursor;
use crate::publication::PublicationId;
use crate::session::inflight::MessageTable;
use crate::time::{Duration, Instant};
use crate::transport::{SendOutcome, Transport};
use crate::types::{QoS, SessionConfig, WillMessage};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// CONNECT sent, CONNACK not yet received.
    #[default]
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscribe {
    pub filters: Vec<(String, QoS)>,
    pub sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUnsubscribe {
    pub filters: Vec<String>,
    pub sent_at: Instant,
}

/// Everything the engine tracks for one client session.
#[derive(Debug)]
pub struct Connection<T> {
    client_id: String,
    transport: T,
    state: ConnectionState,
    cursor: PacketIdCursor,
    keep_alive: Duration,
    pub(crate) last_contact: Instant,
    pub(crate) ping_outstanding: bool,
    pub(crate) healthy: bool,
    retry_interval: Duration,
    min_retry_interval: Duration,
    clean_session: bool,
    will: Option<WillMessage>,
    pub(crate) outbound: MessageTable,
    pub(crate) inbound: MessageTable,
    pub(crate) pending_subscribes: HashMap<u16, PendingSubscribe>,
    pub(crate) pending_unsubscribes: HashMap<u16, PendingUnsubscribe>,
    pub(crate) transient_holds: Vec<PublicationId>,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(config: &SessionConfig, transport: T, now: Instant) -> Self {
        Self {
            client_id: config.client_id.clone(),
            transport,
            state: ConnectionState::Connecting,
            cursor: PacketIdCursor::new(),
            keep_alive: config.keep_alive,
            last_contact: now,
            ping_outstanding: false,
            healthy: true,
            retry_interval: config.retry_interval,
            min_retry_interval: config.min_retry_interval,
            clean_session: config.clean_session,
            will: config.will.clone(),
            outbound: MessageTable::new(),
            inbound: MessageTable::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            transient_holds: Vec::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    #[must_use]
    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    #[must_use]
    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    #[must_use]
    pub fn min_retry_interval(&self) -> Duration {
        self.min_retry_interval
    }

    #[must_use]
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    #[must_use]
    pub fn last_packet_id(&self) -> u16 {
        self.cursor.last()
    }

    #[must_use]
    pub fn outbound(&self) -> &MessageTable {
        &self.outbound
    }

    #[must_use]
    pub fn inbound(&self) -> &MessageTable {
        &self.inbound
    }

    #[must_use]
    pub fn pending_subscribes(&self) -> &HashMap<u16, PendingSubscribe> {
        &self.pending_subscribes
    }

    #[must_use]
    pub fn pending_unsubscribes(&self) -> &HashMap<u16, PendingUnsubscribe> {
        &self.pending_unsubscribes
    }

    #[must_use]
    pub fn transient_hold_count(&self) -> usize {
        self.transient_holds.len()
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Next identifier not held by an outbound publish or a pending
    /// SUBSCRIBE/UNSUBSCRIBE.
    pub(crate) fn assign_packet_id(&mut self) -> Result<u16> {
        let outbound = &self.outbound;
        let subscribes = &self.pending_subscribes;
        let unsubscribes = &self.pending_unsubscribes;
        self.cursor.assign(|id| {
            outbound.contains(id) || subscribes.contains_key(&id) || unsubscribes.contains_key(&id)
        })
    }

    pub(crate) fn resume_packet_ids_after(&mut self, last: u16) {
        if last > self.cursor.last() {
            self.cursor = PacketIdCursor::starting_after(last);
        }
    }

    /// Hands one encoded packet to the transport. Any accepted write counts as
    /// contact; a failed one marks the connection unhealthy.
    pub(crate) fn send(&mut self, header: Bytes, payload: Bytes, now: Instant) -> SendOutcome {
        let outcome = self.transport.send(header, payload);
        match &outcome {
            SendOutcome::Complete | SendOutcome::Interrupted { .. } => {
                self.last_contact = now;
            }
            SendOutcome::Error(e) => {
                error!(
                    client_id = %self.client_id,
                    peer = %self.transport.peer_description(),
                    "Transport send failed: {e}"
                );
                self.healthy = false;
            }
        }
        outcome
    }

    pub(crate) fn take_will(&mut self) -> Option<WillMessage> {
        self.will.take()
    }

    pub(crate) fn close_transport(&mut self) {
        self.transport.close();
        self.state = ConnectionState::Closed;
    }
}
