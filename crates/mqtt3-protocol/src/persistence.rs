//! Seam for durable storage of in-flight exchanges.
//!
//! The engine keeps its own in-memory tables; a `Persistence` implementation
//! only sees `PersistedMessage` records, which carry everything needed to
//! rebuild an entry after a restart.

use crate::error::Result;
use crate::publication::Publication;
use crate::session::inflight::{AwaitingAck, InFlightMessage};
use crate::time::unix_secs_now;
use crate::QoS;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InflightDirection {
    Outbound,
    Inbound,
}

impl InflightDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InflightPhase {
    AwaitingPuback,
    AwaitingPubrec,
    AwaitingPubcomp,
    AwaitingPubrel,
}

impl From<AwaitingAck> for InflightPhase {
    fn from(awaiting: AwaitingAck) -> Self {
        match awaiting {
            AwaitingAck::PubAck => Self::AwaitingPuback,
            AwaitingAck::PubRec => Self::AwaitingPubrec,
            AwaitingAck::PubComp => Self::AwaitingPubcomp,
            AwaitingAck::PubRel => Self::AwaitingPubrel,
        }
    }
}

impl From<InflightPhase> for AwaitingAck {
    fn from(phase: InflightPhase) -> Self {
        match phase {
            InflightPhase::AwaitingPuback => Self::PubAck,
            InflightPhase::AwaitingPubrec => Self::PubRec,
            InflightPhase::AwaitingPubcomp => Self::PubComp,
            InflightPhase::AwaitingPubrel => Self::PubRel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub client_id: String,
    pub packet_id: u16,
    pub direction: InflightDirection,
    pub phase: InflightPhase,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub payload: Vec<u8>,
    pub persisted_at_secs: u64,
    /// Position of the exchange in its session's in-flight order. Phase
    /// updates keep it, so restore can replay exchanges in the order they
    /// started even after identifiers wrap.
    #[serde(default)]
    pub sequence: u64,
}

impl PersistedMessage {
    #[must_use]
    pub fn from_inflight(
        client_id: &str,
        direction: InflightDirection,
        message: &InFlightMessage,
        publication: &Publication,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            packet_id: message.packet_id,
            direction,
            phase: message.awaiting.into(),
            qos: message.qos,
            retain: message.retain,
            topic: publication.topic().to_string(),
            payload: publication.payload().to_vec(),
            persisted_at_secs: unix_secs_now(),
            sequence: message.sequence(),
        }
    }
}

/// Notified at the points where exchanges start, change phase and complete.
///
/// Calls are made with the engine lock held, so implementations should not
/// block for long.
pub trait Persistence: Send {
    /// Also called again, with the new phase, when an outbound `QoS` 2
    /// exchange moves on to waiting for PUBCOMP.
    fn on_enqueue_outbound(&mut self, message: &PersistedMessage) -> Result<()>;

    fn on_enqueue_inbound(&mut self, message: &PersistedMessage) -> Result<()>;

    fn on_complete(
        &mut self,
        client_id: &str,
        packet_id: u16,
        direction: InflightDirection,
    ) -> Result<()>;

    fn restore(&mut self, client_id: &str) -> Result<Vec<PersistedMessage>>;

    fn clear(&mut self, client_id: &str) -> Result<()>;
}

/// Keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn on_enqueue_outbound(&mut self, _message: &PersistedMessage) -> Result<()> {
        Ok(())
    }

    fn on_enqueue_inbound(&mut self, _message: &PersistedMessage) -> Result<()> {
        Ok(())
    }

    fn on_complete(
        &mut self,
        _client_id: &str,
        _packet_id: u16,
        _direction: InflightDirection,
    ) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self, _client_id: &str) -> Result<Vec<PersistedMessage>> {
        Ok(Vec::new())
    }

    fn clear(&mut self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}
