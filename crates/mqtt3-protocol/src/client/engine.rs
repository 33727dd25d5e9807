//! The session engine: registry of client sessions plus everything they share.
//!
//! Every operation is synchronous and takes the current time explicitly. The
//! engine never waits on the network; the transport absorbs partial writes.

use super::events::SessionEvent;
use super::state::{Connection, ConnectionState, PendingSubscribe, PendingUnsubscribe};
use crate::error::{MqttError, Result};
use crate::packet::{
    ConnAckPacket, ConnectPacket, Packet, PubAckPacket, PubCompPacket, PubRecPacket,
    PubRelPacket, PublishPacket, SubAckPacket, SubscribePacket, UnsubAckPacket,
    UnsubscribePacket,
};
use crate::persistence::{InflightDirection, NoPersistence, Persistence, PersistedMessage};
use crate::publication::{PublicationId, PublicationStore};
use crate::qos2::{self, IgnoreReason, QoS2Action};
use crate::session::inflight::{AwaitingAck, InFlightMessage};
use crate::sink::{DiscardSink, MessageSink};
use crate::time::Instant;
use crate::transport::{SendOutcome, Transport};
use crate::types::{Message, PublishResult, QoS, SessionConfig};
use crate::validation::{validate_topic_filter, validate_topic_name};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Outbound `QoS` 1 and 2 publishes that were fully acknowledged.
    pub messages_sent: u64,
    /// Inbound publications handed to the sink.
    pub messages_received: u64,
    pub sessions: usize,
}

/// What the caller has to do once a packet has been handled.
enum Followup {
    Nothing,
    Close { send_will: bool },
}

pub(crate) fn encode_packet(packet: &Packet) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// State shared by all sessions. Kept apart from the registry so handlers can
/// borrow one connection and the shared state at the same time.
#[derive(Debug)]
pub(crate) struct EngineCore<P, S> {
    pub(crate) publications: PublicationStore,
    pub(crate) persistence: P,
    pub(crate) sink: S,
    pub(crate) stats: EngineStats,
}

#[derive(Debug)]
pub struct SessionEngine<T, P = NoPersistence, S = DiscardSink> {
    pub(crate) connections: BTreeMap<String, Connection<T>>,
    pub(crate) core: EngineCore<P, S>,
}

impl<T, P, S> Default for SessionEngine<T, P, S>
where
    T: Transport,
    P: Persistence + Default,
    S: MessageSink + Default,
{
    fn default() -> Self {
        Self::new(P::default(), S::default())
    }
}

impl<T, P, S> SessionEngine<T, P, S>
where
    T: Transport,
    P: Persistence,
    S: MessageSink,
{
    /// Creates an engine with an empty session registry.
    #[must_use]
    pub fn new(persistence: P, sink: S) -> Self {
        Self {
            connections: BTreeMap::new(),
            core: EngineCore {
                publications: PublicationStore::new(),
                persistence,
                sink,
                stats: EngineStats::default(),
            },
        }
    }

    /// Registers a session and sends CONNECT.
    ///
    /// A clean session wipes anything persisted for the client; otherwise the
    /// persisted in-flight messages are restored and resent once CONNACK
    /// accepts the connection.
    pub fn connect(&mut self, config: &SessionConfig, transport: T, now: Instant) -> Result<()> {
        config.validate()?;
        if self.connections.contains_key(&config.client_id) {
            return Err(MqttError::AlreadyConnected);
        }

        let connect = encode_packet(&Packet::Connect(Box::new(ConnectPacket::from_config(
            config,
        ))))?;
        let mut conn = Connection::new(config, transport, now);
        if let SendOutcome::Error(e) = conn.send(connect, Bytes::new(), now) {
            conn.close_transport();
            return Err(MqttError::ConnectionError(format!("CONNECT not sent: {e}")));
        }

        info!(
            client_id = %config.client_id,
            peer = %conn.transport().peer_description(),
            clean_session = config.clean_session,
            "CONNECT sent"
        );
        self.connections.insert(config.client_id.clone(), conn);

        if config.clean_session {
            if let Err(e) = self.core.persistence.clear(&config.client_id) {
                warn!(client_id = %config.client_id, "Failed to clear persisted session: {e}");
            }
        } else if let Err(e) = self.restore_session(&config.client_id, now) {
            warn!(client_id = %config.client_id, "Failed to restore persisted session: {e}");
        }
        Ok(())
    }

    /// Rebuilds the in-flight tables of a registered session from persistence.
    ///
    /// Identifiers already present are left alone. The allocator resumes after
    /// the highest restored outbound identifier. Returns the number restored.
    pub fn restore_session(&mut self, client_id: &str, now: Instant) -> Result<usize> {
        let conn = self
            .connections
            .get_mut(client_id)
            .ok_or_else(|| MqttError::UnknownSession(client_id.to_string()))?;
        let records = self.core.persistence.restore(client_id)?;

        let mut restored = 0;
        let mut last_outbound = 0;
        for record in records {
            if record.qos == QoS::AtMostOnce {
                warn!(client_id, packet_id = record.packet_id, "Skipping persisted QoS 0 entry");
                continue;
            }
            let table = match record.direction {
                InflightDirection::Outbound => &mut conn.outbound,
                InflightDirection::Inbound => &mut conn.inbound,
            };
            if table.contains(record.packet_id) {
                debug!(client_id, packet_id = record.packet_id, "Already in flight, not restored");
                continue;
            }

            let publication = self
                .core
                .publications
                .store_bytes(&record.topic, Bytes::from(record.payload));
            let message = InFlightMessage::new(
                record.packet_id,
                record.qos,
                record.retain,
                publication,
                AwaitingAck::from(record.phase),
                now,
            );
            if let Err(e) = table.insert_at(message, record.sequence) {
                self.core.release(publication);
                return Err(e);
            }
            if record.direction == InflightDirection::Outbound {
                last_outbound = last_outbound.max(record.packet_id);
            }
            restored += 1;
        }

        conn.resume_packet_ids_after(last_outbound);
        if restored > 0 {
            info!(client_id, restored, "Restored in-flight messages");
        }
        Ok(restored)
    }

    /// Feeds one decoded packet from the peer into its session.
    ///
    /// Protocol anomalies are logged and ignored. A transport failure while
    /// answering tears the session down with its will.
    pub fn handle_packet(&mut self, client_id: &str, packet: Packet, now: Instant) -> Result<()> {
        let conn = self
            .connections
            .get_mut(client_id)
            .ok_or_else(|| MqttError::UnknownSession(client_id.to_string()))?;
        conn.last_contact = now;
        trace!(client_id, packet = packet.packet_type().name(), "Received packet");

        let followup = self.core.dispatch(conn, packet, now)?;
        let healthy = conn.is_healthy();

        if !healthy {
            self.close_session(client_id, true)?;
        } else if let Followup::Close { send_will } = followup {
            self.close_session(client_id, send_will)?;
        }
        Ok(())
    }

    /// Publishes `payload` on `topic`.
    ///
    /// `QoS` 1 and 2 get an identifier and an outbound table entry before the
    /// first byte is sent. A transport failure closes the session and is
    /// returned.
    pub fn publish(
        &mut self,
        client_id: &str,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<PublishResult> {
        validate_topic_name(topic)?;
        self.connected_mut(client_id)?;
        let publication = self.core.publications.store(topic, payload);
        self.publish_publication(client_id, publication, qos, retain, now)
    }

    /// Publishes a publication that is already in the store, sharing its
    /// storage. The caller keeps its own reference.
    pub fn publish_stored(
        &mut self,
        client_id: &str,
        publication: PublicationId,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<PublishResult> {
        self.connected_mut(client_id)?;
        self.core.publications.acquire(publication)?;
        self.publish_publication(client_id, publication, qos, retain, now)
    }

    /// Stores a publication for later `publish_stored` calls. The caller owns
    /// one reference and gives it back with `release_publication`.
    pub fn store_publication(&mut self, topic: &str, payload: &[u8]) -> Result<PublicationId> {
        validate_topic_name(topic)?;
        Ok(self.core.publications.store(topic, payload))
    }

    pub fn release_publication(&mut self, publication: PublicationId) -> Result<bool> {
        self.core.publications.release(publication)
    }

    /// Sends SUBSCRIBE and tracks it until SUBACK. Returns the identifier used.
    pub fn subscribe(
        &mut self,
        client_id: &str,
        filters: &[(&str, QoS)],
        now: Instant,
    ) -> Result<u16> {
        if filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        for (filter, _) in filters {
            validate_topic_filter(filter)?;
        }

        let conn = self.connected_mut(client_id)?;
        let packet_id = conn.assign_packet_id()?;
        let packet = filters
            .iter()
            .fold(SubscribePacket::new(packet_id), |packet, (filter, qos)| {
                packet.add_filter(*filter, *qos)
            });
        let bytes = encode_packet(&Packet::Subscribe(packet))?;

        conn.pending_subscribes.insert(
            packet_id,
            PendingSubscribe {
                filters: filters
                    .iter()
                    .map(|(filter, qos)| ((*filter).to_string(), *qos))
                    .collect(),
                sent_at: now,
            },
        );
        if let SendOutcome::Error(e) = conn.send(bytes, Bytes::new(), now) {
            self.close_session(client_id, true)?;
            return Err(e);
        }
        debug!(client_id, packet_id, filters = filters.len(), "SUBSCRIBE sent");
        Ok(packet_id)
    }

    /// Sends UNSUBSCRIBE and tracks it until UNSUBACK. Returns the identifier used.
    pub fn unsubscribe(&mut self, client_id: &str, filters: &[&str], now: Instant) -> Result<u16> {
        if filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "UNSUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        for filter in filters {
            validate_topic_filter(filter)?;
        }

        let conn = self.connected_mut(client_id)?;
        let packet_id = conn.assign_packet_id()?;
        let packet = filters
            .iter()
            .fold(UnsubscribePacket::new(packet_id), |packet, filter| {
                packet.add_filter(*filter)
            });
        let bytes = encode_packet(&Packet::Unsubscribe(packet))?;

        conn.pending_unsubscribes.insert(
            packet_id,
            PendingUnsubscribe {
                filters: filters.iter().map(|filter| (*filter).to_string()).collect(),
                sent_at: now,
            },
        );
        if let SendOutcome::Error(e) = conn.send(bytes, Bytes::new(), now) {
            self.close_session(client_id, true)?;
            return Err(e);
        }
        debug!(client_id, packet_id, "UNSUBSCRIBE sent");
        Ok(packet_id)
    }

    /// Sends DISCONNECT and closes the session without its will.
    pub fn disconnect(&mut self, client_id: &str, now: Instant) -> Result<()> {
        let conn = self
            .connections
            .get_mut(client_id)
            .ok_or_else(|| MqttError::UnknownSession(client_id.to_string()))?;
        let bytes = encode_packet(&Packet::Disconnect)?;
        if conn.send(bytes, Bytes::new(), now).is_error() {
            debug!(client_id, "DISCONNECT could not be delivered");
        }
        self.close_session(client_id, false)
    }

    /// Tears a session down.
    ///
    /// Emits the will when asked to and one is configured, releases every
    /// publication both tables and the transient holds refer to, and closes the
    /// transport. The session leaves the registry, so a second call reports
    /// `NotConnected`.
    pub fn close_session(&mut self, client_id: &str, send_will: bool) -> Result<()> {
        let mut conn = self
            .connections
            .remove(client_id)
            .ok_or(MqttError::NotConnected)?;

        let will_sent = match conn.take_will() {
            Some(will) if send_will => {
                info!(client_id, topic = %will.topic, "Publishing will message");
                self.core.sink.will(client_id, &will);
                true
            }
            _ => false,
        };

        let released = self.core.release_connection(&mut conn);
        if conn.clean_session() {
            if let Err(e) = self.core.persistence.clear(client_id) {
                warn!(client_id, "Failed to clear persisted session: {e}");
            }
        }
        conn.close_transport();

        info!(client_id, will_sent, released, "Session closed");
        self.core
            .sink
            .event(client_id, SessionEvent::Closed { will_sent });
        Ok(())
    }

    /// Called once the transport has drained a buffered write. Releases the
    /// transient `QoS` 0 holds if nothing is left pending.
    pub fn write_completed(&mut self, client_id: &str) -> Result<usize> {
        let conn = self
            .connections
            .get_mut(client_id)
            .ok_or_else(|| MqttError::UnknownSession(client_id.to_string()))?;
        if conn.transport().has_pending_writes() {
            return Ok(0);
        }
        Ok(self.core.release_transient_holds(conn))
    }

    /// Closes every registered session without wills. Returns how many were closed.
    pub fn shutdown(&mut self) -> usize {
        let client_ids: Vec<String> = self.connections.keys().cloned().collect();
        let mut closed = 0;
        for client_id in client_ids {
            if self.close_session(&client_id, false).is_ok() {
                closed += 1;
            }
        }
        info!(closed, "Session engine shut down");
        closed
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.connections.len(),
            ..self.core.stats
        }
    }

    #[must_use]
    pub fn connection(&self, client_id: &str) -> Option<&Connection<T>> {
        self.connections.get(client_id)
    }

    pub fn connection_mut(&mut self, client_id: &str) -> Option<&mut Connection<T>> {
        self.connections.get_mut(client_id)
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn publications(&self) -> &PublicationStore {
        &self.core.publications
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.core.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.core.sink
    }

    #[must_use]
    pub fn persistence(&self) -> &P {
        &self.core.persistence
    }

    pub fn persistence_mut(&mut self) -> &mut P {
        &mut self.core.persistence
    }

    fn connected_mut(&mut self, client_id: &str) -> Result<&mut Connection<T>> {
        let conn = self
            .connections
            .get_mut(client_id)
            .ok_or_else(|| MqttError::UnknownSession(client_id.to_string()))?;
        if conn.is_connected() {
            Ok(conn)
        } else {
            Err(MqttError::NotConnected)
        }
    }

    /// Sends a publication the caller has already counted one reference for.
    /// That reference moves into the outbound table, a transient hold, or is
    /// released right away.
    fn publish_publication(
        &mut self,
        client_id: &str,
        publication: PublicationId,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<PublishResult> {
        let Some(conn) = self.connections.get_mut(client_id) else {
            self.core.release(publication);
            return Err(MqttError::UnknownSession(client_id.to_string()));
        };

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            match conn.assign_packet_id() {
                Ok(id) => Some(id),
                Err(e) => {
                    self.core.release(publication);
                    return Err(e);
                }
            }
        };
        let (header, payload) =
            match self
                .core
                .encode_publish(publication, packet_id, qos, retain, false)
            {
                Ok(parts) => parts,
                Err(e) => {
                    self.core.release(publication);
                    return Err(e);
                }
            };

        let outcome = match packet_id {
            None => {
                let outcome = conn.send(header, payload, now);
                if let SendOutcome::Interrupted { written } = outcome {
                    trace!(client_id, written, "QoS 0 write interrupted, holding publication");
                    conn.transient_holds.push(publication);
                } else {
                    self.core.release(publication);
                }
                outcome
            }
            Some(packet_id) => {
                let awaiting = AwaitingAck::for_outbound(qos).unwrap_or(AwaitingAck::PubAck);
                let message =
                    InFlightMessage::new(packet_id, qos, retain, publication, awaiting, now);
                if let Err(e) = conn.outbound.insert(message) {
                    self.core.release(publication);
                    return Err(e);
                }
                if let Some(message) = conn.outbound.get(packet_id) {
                    self.core
                        .persist(client_id, InflightDirection::Outbound, message);
                }
                debug!(client_id, packet_id, qos = qos as u8, "PUBLISH sent");
                conn.send(header, payload, now)
            }
        };

        if let SendOutcome::Error(e) = outcome {
            self.close_session(client_id, true)?;
            return Err(e);
        }
        Ok(match packet_id {
            None => PublishResult::QoS0,
            Some(packet_id) => PublishResult::QoS1Or2 { packet_id },
        })
    }
}

impl<P: Persistence, S: MessageSink> EngineCore<P, S> {
    fn dispatch<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        packet: Packet,
        now: Instant,
    ) -> Result<Followup> {
        let client_id = conn.client_id().to_owned();
        match packet {
            Packet::ConnAck(connack) => return self.handle_connack(conn, &client_id, connack, now),
            Packet::Publish(publish) => self.handle_publish(conn, &client_id, publish, now)?,
            Packet::PubAck(ack) => self.handle_puback(conn, &client_id, ack),
            Packet::PubRec(ack) => self.handle_pubrec(conn, &client_id, ack, now)?,
            Packet::PubRel(ack) => self.handle_pubrel(conn, &client_id, ack, now)?,
            Packet::PubComp(ack) => self.handle_pubcomp(conn, &client_id, ack),
            Packet::SubAck(ack) => self.handle_suback(conn, &client_id, ack),
            Packet::UnsubAck(ack) => self.handle_unsuback(conn, &client_id, ack),
            Packet::PingResp => {
                trace!(client_id = %client_id, "PINGRESP received");
                conn.ping_outstanding = false;
            }
            other => {
                warn!(
                    client_id = %client_id,
                    packet = other.packet_type().name(),
                    "Unexpected packet from server, ignoring"
                );
            }
        }
        Ok(Followup::Nothing)
    }

    fn handle_connack<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        connack: ConnAckPacket,
        now: Instant,
    ) -> Result<Followup> {
        if conn.state() != ConnectionState::Connecting {
            warn!(client_id, "CONNACK on an established session, ignoring");
            return Ok(Followup::Nothing);
        }
        if !connack.return_code.is_accepted() {
            warn!(client_id, return_code = ?connack.return_code, "Connection refused");
            self.sink.event(
                client_id,
                SessionEvent::ConnectionRefused(connack.return_code),
            );
            return Ok(Followup::Close { send_will: false });
        }

        conn.set_state(ConnectionState::Connected);
        conn.healthy = true;
        conn.ping_outstanding = false;
        info!(client_id, peer = %conn.transport().peer_description(), "Connected");
        self.sink.event(client_id, SessionEvent::Connected);

        if !conn.clean_session() && !conn.outbound.is_empty() {
            let resent = self.resend_outbound(conn, now, |_| true)?;
            debug!(client_id, resent, "Resent in-flight messages of resumed session");
        }
        Ok(Followup::Nothing)
    }

    fn handle_publish<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        publish: PublishPacket,
        now: Instant,
    ) -> Result<()> {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => self.deliver(client_id, Message::from(publish)),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                let ack = encode_packet(&Packet::PubAck(PubAckPacket::new(packet_id)))?;
                conn.send(ack, Bytes::new(), now);
                self.deliver(client_id, Message::from(publish));
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let has_pending = conn.inbound.contains(packet_id);
                for action in qos2::handle_incoming_publish_qos2(packet_id, has_pending) {
                    match action {
                        QoS2Action::TrackIncoming { packet_id }
                        | QoS2Action::ReplaceIncoming { packet_id } => {
                            let publication =
                                self.publications.store(&publish.topic_name, &publish.payload);
                            let message = InFlightMessage::new(
                                packet_id,
                                QoS::ExactlyOnce,
                                publish.retain,
                                publication,
                                AwaitingAck::PubRel,
                                now,
                            );
                            if let Some(old) = conn.inbound.replace(message) {
                                debug!(client_id, packet_id, "Duplicate QoS 2 PUBLISH replaced stored copy");
                                self.release(old.publication);
                            }
                            if let Some(message) = conn.inbound.get(packet_id) {
                                self.persist(client_id, InflightDirection::Inbound, message);
                            }
                        }
                        QoS2Action::SendPubRec { packet_id } => {
                            let ack = encode_packet(&Packet::PubRec(PubRecPacket::new(packet_id)))?;
                            conn.send(ack, Bytes::new(), now);
                        }
                        _ => {}
                    }
                }
            }
            (qos, None) => {
                warn!(client_id, qos = qos as u8, "PUBLISH without packet identifier, ignoring");
            }
        }
        Ok(())
    }

    fn handle_puback<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        ack: PubAckPacket,
    ) {
        let packet_id = ack.packet_id;
        match conn.outbound.get(packet_id).map(|m| m.qos) {
            None => log_unmatched("PUBACK", client_id, packet_id, ack.dup),
            Some(qos) if qos != QoS::AtLeastOnce => {
                warn!(client_id, packet_id, qos = qos as u8, "PUBACK for a message of another QoS");
            }
            Some(_) => {
                if let Some(message) = conn.outbound.remove(packet_id) {
                    self.complete_outbound(client_id, message);
                }
            }
        }
    }

    fn handle_pubrec<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        ack: PubRecPacket,
        now: Instant,
    ) -> Result<()> {
        let entry = conn.outbound.get(ack.packet_id).map(|m| (m.qos, m.awaiting));
        for action in qos2::handle_incoming_pubrec(ack.packet_id, entry) {
            match action {
                QoS2Action::SendPubRel { packet_id } => {
                    let rel = encode_packet(&Packet::PubRel(PubRelPacket::new(packet_id)))?;
                    conn.send(rel, Bytes::new(), now);
                }
                QoS2Action::AwaitPubComp { packet_id } => {
                    if let Some(message) = conn.outbound.get_mut(packet_id) {
                        message.awaiting = AwaitingAck::PubComp;
                        message.last_touch = now;
                    }
                    if let Some(message) = conn.outbound.get(packet_id) {
                        self.persist(client_id, InflightDirection::Outbound, message);
                    }
                }
                QoS2Action::Ignore { packet_id, reason } => {
                    log_ignored("PUBREC", client_id, packet_id, reason, ack.dup);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_pubcomp<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        ack: PubCompPacket,
    ) {
        let entry = conn.outbound.get(ack.packet_id).map(|m| (m.qos, m.awaiting));
        for action in qos2::handle_incoming_pubcomp(ack.packet_id, entry) {
            match action {
                QoS2Action::CompleteFlow { packet_id } => {
                    if let Some(message) = conn.outbound.remove(packet_id) {
                        self.complete_outbound(client_id, message);
                    }
                }
                QoS2Action::Ignore { packet_id, reason } => {
                    log_ignored("PUBCOMP", client_id, packet_id, reason, ack.dup);
                }
                _ => {}
            }
        }
    }

    fn handle_pubrel<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        ack: PubRelPacket,
        now: Instant,
    ) -> Result<()> {
        let entry = conn.inbound.get(ack.packet_id).map(|m| (m.qos, m.awaiting));
        for action in qos2::handle_incoming_pubrel(ack.packet_id, entry, ack.dup) {
            match action {
                QoS2Action::SendPubComp { packet_id } => {
                    let comp = encode_packet(&Packet::PubComp(PubCompPacket::new(packet_id)))?;
                    conn.send(comp, Bytes::new(), now);
                }
                QoS2Action::DeliverMessage { packet_id } => {
                    let message = conn.inbound.get(packet_id).and_then(|entry| {
                        self.publications
                            .get(entry.publication)
                            .map(|publication| Message {
                                topic: publication.topic().to_string(),
                                payload: publication.payload(),
                                qos: entry.qos,
                                retain: entry.retain,
                            })
                    });
                    if let Some(message) = message {
                        self.deliver(client_id, message);
                    }
                }
                QoS2Action::ReleaseIncoming { packet_id } => {
                    if let Some(entry) = conn.inbound.remove(packet_id) {
                        self.persist_complete(client_id, packet_id, InflightDirection::Inbound);
                        self.release(entry.publication);
                    }
                }
                QoS2Action::Ignore { packet_id, reason } => {
                    log_ignored("PUBREL", client_id, packet_id, reason, ack.dup);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_suback<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        ack: SubAckPacket,
    ) {
        let Some(pending) = conn.pending_subscribes.remove(&ack.packet_id) else {
            log_unmatched("SUBACK", client_id, ack.packet_id, false);
            return;
        };
        if pending.filters.len() != ack.granted_qos.len() {
            warn!(
                client_id,
                packet_id = ack.packet_id,
                requested = pending.filters.len(),
                granted = ack.granted_qos.len(),
                "SUBACK grant count does not match the request"
            );
        }
        debug!(client_id, packet_id = ack.packet_id, "Subscription acknowledged");
        self.sink.event(
            client_id,
            SessionEvent::Subscribed {
                packet_id: ack.packet_id,
                granted_qos: ack.granted_qos,
            },
        );
    }

    fn handle_unsuback<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        client_id: &str,
        ack: UnsubAckPacket,
    ) {
        if conn.pending_unsubscribes.remove(&ack.packet_id).is_none() {
            log_unmatched("UNSUBACK", client_id, ack.packet_id, ack.dup);
            return;
        }
        debug!(client_id, packet_id = ack.packet_id, "Unsubscribe acknowledged");
        self.sink.event(
            client_id,
            SessionEvent::Unsubscribed {
                packet_id: ack.packet_id,
            },
        );
    }

    /// Resends every outbound entry `due` selects, in insertion order: PUBLISH
    /// with DUP until PUBREC arrives, PUBREL with DUP after. Stops at the first
    /// transport error, leaving the connection unhealthy.
    pub(crate) fn resend_outbound<T: Transport>(
        &mut self,
        conn: &mut Connection<T>,
        now: Instant,
        mut due: impl FnMut(&InFlightMessage) -> bool,
    ) -> Result<usize> {
        let mut resent = 0;
        for packet_id in conn.outbound.ids_in_order() {
            let Some(message) = conn.outbound.get(packet_id) else {
                continue;
            };
            if !due(message) {
                continue;
            }
            let (awaiting, qos, retain, publication) =
                (message.awaiting, message.qos, message.retain, message.publication);

            let (header, payload) = if awaiting == AwaitingAck::PubComp {
                let rel = PubRelPacket::new(packet_id).with_dup(true);
                (encode_packet(&Packet::PubRel(rel))?, Bytes::new())
            } else {
                self.encode_publish(publication, Some(packet_id), qos, retain, true)?
            };

            debug!(client_id = %conn.client_id(), packet_id, ?awaiting, "Resending in-flight message");
            if conn.send(header, payload, now).is_error() {
                break;
            }
            if let Some(message) = conn.outbound.get_mut(packet_id) {
                message.last_touch = now;
            }
            resent += 1;
        }
        Ok(resent)
    }

    fn encode_publish(
        &self,
        publication: PublicationId,
        packet_id: Option<u16>,
        qos: QoS,
        retain: bool,
        dup: bool,
    ) -> Result<(Bytes, Bytes)> {
        let stored = self
            .publications
            .get(publication)
            .ok_or(MqttError::PublicationReleased(publication.get()))?;
        let mut packet = PublishPacket::new(stored.topic(), stored.payload(), qos)
            .with_retain(retain)
            .with_dup(dup);
        if let Some(packet_id) = packet_id {
            packet = packet.with_packet_id(packet_id);
        }
        let mut header = BytesMut::new();
        packet.encode_header(&mut header)?;
        Ok((header.freeze(), packet.payload))
    }

    fn complete_outbound(&mut self, client_id: &str, message: InFlightMessage) {
        self.persist_complete(client_id, message.packet_id, InflightDirection::Outbound);
        self.release(message.publication);
        self.stats.messages_sent += 1;
        debug!(client_id, packet_id = message.packet_id, qos = message.qos as u8, "Publish complete");
        self.sink.event(
            client_id,
            SessionEvent::PublishComplete {
                packet_id: message.packet_id,
                qos: message.qos,
            },
        );
    }

    fn deliver(&mut self, client_id: &str, message: Message) {
        self.stats.messages_received += 1;
        trace!(client_id, topic = %message.topic, qos = message.qos as u8, "Delivering message");
        self.sink.deliver(client_id, message);
    }

    pub(crate) fn release(&mut self, publication: PublicationId) {
        if let Err(e) = self.publications.release(publication) {
            error!("Publication accounting out of step: {e}");
        }
    }

    pub(crate) fn release_transient_holds<T>(&mut self, conn: &mut Connection<T>) -> usize {
        let holds: Vec<PublicationId> = conn.transient_holds.drain(..).collect();
        for publication in &holds {
            self.release(*publication);
        }
        holds.len()
    }

    /// Drops every reference the connection holds. Returns how many were dropped.
    fn release_connection<T>(&mut self, conn: &mut Connection<T>) -> usize {
        let mut released = 0;
        for message in conn.outbound.drain().into_iter().chain(conn.inbound.drain()) {
            self.release(message.publication);
            released += 1;
        }
        released += self.release_transient_holds(conn);
        conn.pending_subscribes.clear();
        conn.pending_unsubscribes.clear();
        released
    }

    fn persist(&mut self, client_id: &str, direction: InflightDirection, message: &InFlightMessage) {
        let Some(publication) = self.publications.get(message.publication) else {
            return;
        };
        let record = PersistedMessage::from_inflight(client_id, direction, message, publication);
        let result = match direction {
            InflightDirection::Outbound => self.persistence.on_enqueue_outbound(&record),
            InflightDirection::Inbound => self.persistence.on_enqueue_inbound(&record),
        };
        if let Err(e) = result {
            warn!(client_id, packet_id = message.packet_id, "Failed to persist in-flight message: {e}");
        }
    }

    fn persist_complete(&mut self, client_id: &str, packet_id: u16, direction: InflightDirection) {
        if let Err(e) = self.persistence.on_complete(client_id, packet_id, direction) {
            warn!(client_id, packet_id, "Failed to remove persisted message: {e}");
        }
    }
}

fn log_unmatched(kind: &str, client_id: &str, packet_id: u16, dup: bool) {
    if dup {
        debug!(client_id, packet_id, "Duplicate {kind} with no matching exchange");
    } else {
        warn!(client_id, packet_id, "{kind} with no matching exchange, ignoring");
    }
}

fn log_ignored(kind: &str, client_id: &str, packet_id: u16, reason: IgnoreReason, dup: bool) {
    if reason == IgnoreReason::UnknownPacketId {
        log_unmatched(kind, client_id, packet_id, dup);
    } else if !dup {
        warn!(client_id, packet_id, "{kind} ignored: {}", reason.describe());
    }
}
