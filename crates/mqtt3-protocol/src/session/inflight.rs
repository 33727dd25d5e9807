//! Per-connection tables of unacknowledged `QoS` 1 and 2 exchanges.

use crate::error::{MqttError, Result};
use crate::publication::PublicationId;
use crate::time::Instant;
use crate::QoS;
use std::collections::HashMap;

/// The packet an in-flight message is waiting for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AwaitingAck {
    PubAck,
    PubRec,
    PubComp,
    PubRel,
}

impl AwaitingAck {
    /// First acknowledgment an outbound publish of `qos` waits for.
    #[must_use]
    pub fn for_outbound(qos: QoS) -> Option<Self> {
        match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(Self::PubAck),
            QoS::ExactlyOnce => Some(Self::PubRec),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub qos: QoS,
    pub retain: bool,
    pub publication: PublicationId,
    pub awaiting: AwaitingAck,
    pub last_touch: Instant,
    sequence: u64,
}

impl InFlightMessage {
    #[must_use]
    pub fn new(
        packet_id: u16,
        qos: QoS,
        retain: bool,
        publication: PublicationId,
        awaiting: AwaitingAck,
        last_touch: Instant,
    ) -> Self {
        Self {
            packet_id,
            qos,
            retain,
            publication,
            awaiting,
            last_touch,
            sequence: 0,
        }
    }

    /// Position in the owning table's insertion order. Zero until inserted.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Identifier-keyed table that still iterates in insertion order, which is
/// the order retries go back out in.
#[derive(Debug, Default)]
pub struct MessageTable {
    entries: HashMap<u16, InFlightMessage>,
    next_sequence: u64,
}

impl MessageTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut message: InFlightMessage) -> Result<()> {
        if self.entries.contains_key(&message.packet_id) {
            return Err(MqttError::PacketIdInUse(message.packet_id));
        }
        message.sequence = self.bump_sequence();
        self.entries.insert(message.packet_id, message);
        Ok(())
    }

    /// Inserts an entry read back from storage at its recorded position.
    /// A zero `sequence` means none was recorded and the entry goes last.
    pub fn insert_at(&mut self, mut message: InFlightMessage, sequence: u64) -> Result<()> {
        if self.entries.contains_key(&message.packet_id) {
            return Err(MqttError::PacketIdInUse(message.packet_id));
        }
        message.sequence = if sequence == 0 {
            self.bump_sequence()
        } else {
            self.next_sequence = self.next_sequence.max(sequence);
            sequence
        };
        self.entries.insert(message.packet_id, message);
        Ok(())
    }

    /// Replaces the entry for the same identifier in place, keeping its
    /// position. Returns the entry that was displaced.
    pub fn replace(&mut self, mut message: InFlightMessage) -> Option<InFlightMessage> {
        message.sequence = match self.entries.get(&message.packet_id) {
            Some(existing) => existing.sequence,
            None => self.bump_sequence(),
        };
        self.entries.insert(message.packet_id, message)
    }

    #[must_use]
    pub fn get(&self, packet_id: u16) -> Option<&InFlightMessage> {
        self.entries.get(&packet_id)
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut InFlightMessage> {
        self.entries.get_mut(&packet_id)
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        self.entries.remove(&packet_id)
    }

    #[must_use]
    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn ids_in_order(&self) -> Vec<u16> {
        let mut ordered: Vec<(u64, u16)> = self
            .entries
            .values()
            .map(|message| (message.sequence, message.packet_id))
            .collect();
        ordered.sort_unstable();
        ordered.into_iter().map(|(_, id)| id).collect()
    }

    /// Empties the table, yielding entries in insertion order.
    pub fn drain(&mut self) -> Vec<InFlightMessage> {
        let mut drained: Vec<InFlightMessage> = self.entries.drain().map(|(_, m)| m).collect();
        drained.sort_unstable_by_key(|message| message.sequence);
        drained
    }

    fn bump_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}
