//! In-memory doubles for the engine seams.
//!
//! Each double is a cheap handle over shared state, so a test can hand a clone
//! to the engine and keep one to inspect afterwards.

use crate::client::SessionEvent;
use crate::error::{MqttError, Result};
use crate::persistence::{InflightDirection, Persistence, PersistedMessage};
use crate::sink::MessageSink;
use crate::transport::{SendOutcome, Transport};
use crate::types::{Message, WillMessage};
use crate::Packet;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TransportLog {
    frames: Vec<Bytes>,
    outcomes: VecDeque<SendOutcome>,
    pending: bool,
    closed: bool,
}

/// Transport that records every frame it accepts.
///
/// Outcomes can be scripted with `push_outcome`; once the script runs out every
/// send completes. An `Interrupted` outcome leaves writes pending until
/// `set_pending(false)`.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.log.lock().outcomes.push_back(outcome);
    }

    pub fn set_pending(&self, pending: bool) {
        self.log.lock().pending = pending;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }

    #[must_use]
    pub fn frames(&self) -> Vec<Bytes> {
        self.log.lock().frames.clone()
    }

    /// Every recorded frame, decoded.
    #[must_use]
    pub fn sent_packets(&self) -> Vec<Packet> {
        decode_all(&self.log.lock().frames)
    }

    /// Decodes and forgets the recorded frames.
    pub fn take_sent(&self) -> Vec<Packet> {
        let frames = std::mem::take(&mut self.log.lock().frames);
        decode_all(&frames)
    }
}

fn decode_all(frames: &[Bytes]) -> Vec<Packet> {
    frames
        .iter()
        .filter_map(|frame| {
            let mut buf = BytesMut::from(&frame[..]);
            Packet::decode_frame(&mut buf).ok().flatten()
        })
        .collect()
}

impl Transport for RecordingTransport {
    fn send(&mut self, header: Bytes, payload: Bytes) -> SendOutcome {
        let mut log = self.log.lock();
        if log.closed {
            return SendOutcome::Error(MqttError::ConnectionError(
                "transport closed".to_string(),
            ));
        }
        let outcome = log.outcomes.pop_front().unwrap_or(SendOutcome::Complete);
        if !outcome.is_error() {
            let mut frame = BytesMut::with_capacity(header.len() + payload.len());
            frame.extend_from_slice(&header);
            frame.extend_from_slice(&payload);
            log.frames.push(frame.freeze());
        }
        if matches!(outcome, SendOutcome::Interrupted { .. }) {
            log.pending = true;
        }
        outcome
    }

    fn has_pending_writes(&self) -> bool {
        self.log.lock().pending
    }

    fn peer_description(&self) -> String {
        "recording".to_string()
    }

    fn close(&mut self) {
        self.log.lock().closed = true;
    }
}

#[derive(Debug, Default)]
struct SinkLog {
    delivered: Vec<(String, Message)>,
    wills: Vec<(String, WillMessage)>,
    events: Vec<(String, SessionEvent)>,
}

/// Sink that keeps everything handed to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn delivered(&self) -> Vec<(String, Message)> {
        self.log.lock().delivered.clone()
    }

    #[must_use]
    pub fn wills(&self) -> Vec<(String, WillMessage)> {
        self.log.lock().wills.clone()
    }

    #[must_use]
    pub fn events(&self) -> Vec<(String, SessionEvent)> {
        self.log.lock().events.clone()
    }
}

impl MessageSink for RecordingSink {
    fn deliver(&mut self, client_id: &str, message: Message) {
        self.log
            .lock()
            .delivered
            .push((client_id.to_string(), message));
    }

    fn will(&mut self, client_id: &str, will: &WillMessage) {
        self.log
            .lock()
            .wills
            .push((client_id.to_string(), will.clone()));
    }

    fn event(&mut self, client_id: &str, event: SessionEvent) {
        self.log.lock().events.push((client_id.to_string(), event));
    }
}

/// One call made on a `RecordingPersistence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceCall {
    EnqueueOutbound { client_id: String, packet_id: u16 },
    EnqueueInbound { client_id: String, packet_id: u16 },
    Complete {
        client_id: String,
        packet_id: u16,
        direction: InflightDirection,
    },
    Restore { client_id: String },
    Clear { client_id: String },
}

type RecordKey = (String, InflightDirection, u16);

#[derive(Debug, Default)]
struct PersistenceLog {
    calls: Vec<PersistenceCall>,
    records: BTreeMap<RecordKey, PersistedMessage>,
    fail: bool,
}

/// Persistence that logs its calls and keeps records in memory, so restore
/// works across engines sharing one handle.
#[derive(Debug, Clone, Default)]
pub struct RecordingPersistence {
    log: Arc<Mutex<PersistenceLog>>,
}

impl RecordingPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<PersistenceCall> {
        self.log.lock().calls.clone()
    }

    #[must_use]
    pub fn records(&self) -> Vec<PersistedMessage> {
        self.log.lock().records.values().cloned().collect()
    }

    /// Makes every later call fail.
    pub fn set_failing(&self, fail: bool) {
        self.log.lock().fail = fail;
    }

    fn check(log: &PersistenceLog) -> Result<()> {
        if log.fail {
            Err(MqttError::Persistence("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Persistence for RecordingPersistence {
    fn on_enqueue_outbound(&mut self, message: &PersistedMessage) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(PersistenceCall::EnqueueOutbound {
            client_id: message.client_id.clone(),
            packet_id: message.packet_id,
        });
        Self::check(&log)?;
        log.records.insert(
            (
                message.client_id.clone(),
                InflightDirection::Outbound,
                message.packet_id,
            ),
            message.clone(),
        );
        Ok(())
    }

    fn on_enqueue_inbound(&mut self, message: &PersistedMessage) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(PersistenceCall::EnqueueInbound {
            client_id: message.client_id.clone(),
            packet_id: message.packet_id,
        });
        Self::check(&log)?;
        log.records.insert(
            (
                message.client_id.clone(),
                InflightDirection::Inbound,
                message.packet_id,
            ),
            message.clone(),
        );
        Ok(())
    }

    fn on_complete(
        &mut self,
        client_id: &str,
        packet_id: u16,
        direction: InflightDirection,
    ) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(PersistenceCall::Complete {
            client_id: client_id.to_string(),
            packet_id,
            direction,
        });
        Self::check(&log)?;
        log.records
            .remove(&(client_id.to_string(), direction, packet_id));
        Ok(())
    }

    fn restore(&mut self, client_id: &str) -> Result<Vec<PersistedMessage>> {
        let mut log = self.log.lock();
        log.calls.push(PersistenceCall::Restore {
            client_id: client_id.to_string(),
        });
        Self::check(&log)?;
        let mut records: Vec<PersistedMessage> = log
            .records
            .values()
            .filter(|record| record.client_id == client_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.sequence, record.direction, record.packet_id));
        Ok(records)
    }

    fn clear(&mut self, client_id: &str) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(PersistenceCall::Clear {
            client_id: client_id.to_string(),
        });
        Self::check(&log)?;
        log.records.retain(|(owner, _, _), _| owner != client_id);
        Ok(())
    }
}
