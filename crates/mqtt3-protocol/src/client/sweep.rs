//! Periodic keep-alive and retry pass over every session.

use super::engine::{encode_packet, SessionEngine};
use crate::keepalive::{is_keepalive_due, is_retry_due};
use crate::packet::Packet;
use crate::persistence::Persistence;
use crate::sink::MessageSink;
use crate::time::{elapsed_between, Instant};
use crate::transport::Transport;
use bytes::Bytes;
use tracing::{debug, trace, warn};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pings_sent: usize,
    pub messages_retried: usize,
    pub sessions_closed: usize,
    pub holds_released: usize,
}

impl<T, P, S> SessionEngine<T, P, S>
where
    T: Transport,
    P: Persistence,
    S: MessageSink,
{
    /// Runs keep-alive for every connected session and, when `do_retry` is
    /// set, resends the in-flight messages whose retry interval has passed.
    ///
    /// A session whose transport fails is torn down with its will; the sweep
    /// carries on with the next one.
    pub fn sweep(&mut self, now: Instant, do_retry: bool) -> SweepReport {
        let mut report = SweepReport::default();
        let mut doomed = Vec::new();

        for (client_id, conn) in &mut self.connections {
            if !conn.is_connected() {
                continue;
            }
            if !conn.is_healthy() {
                doomed.push(client_id.clone());
                continue;
            }

            if is_keepalive_due(elapsed_between(now, conn.last_contact), conn.keep_alive()) {
                let sent = encode_packet(&Packet::PingReq)
                    .map(|bytes| conn.send(bytes, Bytes::new(), now));
                match sent {
                    Ok(outcome) if !outcome.is_error() => {
                        trace!(client_id = %client_id, "PINGREQ sent");
                        conn.last_contact = now;
                        conn.ping_outstanding = true;
                        report.pings_sent += 1;
                    }
                    _ => {
                        doomed.push(client_id.clone());
                        continue;
                    }
                }
            }

            if conn.transport().has_pending_writes() {
                trace!(client_id = %client_id, "Writes pending, skipping retries");
                continue;
            }
            report.holds_released += self.core.release_transient_holds(conn);

            if !do_retry || conn.retry_interval().is_zero() {
                continue;
            }
            let (retry, floor) = (conn.retry_interval(), conn.min_retry_interval());
            let resent = self.core.resend_outbound(conn, now, |message| {
                is_retry_due(elapsed_between(now, message.last_touch), retry, floor)
            });
            match resent {
                Ok(count) => {
                    if count > 0 {
                        debug!(client_id = %client_id, count, "Retried in-flight messages");
                    }
                    report.messages_retried += count;
                }
                Err(e) => warn!(client_id = %client_id, "Retry failed: {e}"),
            }
            if !conn.is_healthy() {
                doomed.push(client_id.clone());
            }
        }

        for client_id in doomed {
            if self.close_session(&client_id, true).is_ok() {
                report.sessions_closed += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqttError;
    use crate::packet::{ConnAckPacket, PubRecPacket, PubRelPacket};
    use crate::testing::{RecordingSink, RecordingTransport};
    use crate::time::Duration;
    use crate::transport::SendOutcome;
    use crate::types::{ConnectReturnCode, QoS, SessionConfig, WillMessage};
    use crate::NoPersistence;

    type TestEngine = SessionEngine<RecordingTransport, NoPersistence, RecordingSink>;

    fn secs(t0: Instant, n: u64) -> Instant {
        t0 + Duration::from_secs(n)
    }

    fn connected(engine: &mut TestEngine, config: &SessionConfig, t0: Instant) -> RecordingTransport {
        let transport = RecordingTransport::new();
        engine.connect(config, transport.clone(), t0).unwrap();
        engine
            .handle_packet(
                &config.client_id,
                Packet::ConnAck(ConnAckPacket::new(ConnectReturnCode::Accepted)),
                t0,
            )
            .unwrap();
        transport.take_sent();
        transport
    }

    fn retrying(client_id: &str) -> SessionConfig {
        SessionConfig::new(client_id)
            .with_retry_interval(Duration::from_secs(5))
            .with_min_retry_interval(Duration::from_secs(1))
    }

    #[test]
    fn test_retry_resends_publish_with_dup() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let transport = connected(&mut engine, &retrying("client-a"), t0);
        engine
            .publish("client-a", "t", b"x", QoS::AtLeastOnce, false, t0)
            .unwrap();
        transport.take_sent();

        let report = engine.sweep(secs(t0, 6), true);

        assert_eq!(report.messages_retried, 1);
        assert_eq!(report.pings_sent, 0);
        match &transport.take_sent()[..] {
            [Packet::Publish(publish)] => {
                assert_eq!(publish.packet_id, Some(1));
                assert!(publish.dup);
            }
            other => panic!("unexpected packets {other:?}"),
        }
        let entry = engine.connection("client-a").unwrap().outbound().get(1).cloned().unwrap();
        assert_eq!(entry.last_touch, secs(t0, 6));
    }

    #[test]
    fn test_no_resend_without_retry_flag() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let transport = connected(&mut engine, &retrying("client-a"), t0);
        engine
            .publish("client-a", "t", b"x", QoS::AtLeastOnce, false, t0)
            .unwrap();
        transport.take_sent();

        let report = engine.sweep(secs(t0, 6), false);

        assert_eq!(report, SweepReport::default());
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn test_default_floor_holds_back_short_intervals() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let config = SessionConfig::new("client-a").with_retry_interval(Duration::from_secs(5));
        let transport = connected(&mut engine, &config, t0);
        engine
            .publish("client-a", "t", b"x", QoS::AtLeastOnce, false, t0)
            .unwrap();
        transport.take_sent();

        assert_eq!(engine.sweep(secs(t0, 6), true).messages_retried, 0);
        assert_eq!(engine.sweep(secs(t0, 10), true).messages_retried, 0);
        assert_eq!(engine.sweep(secs(t0, 11), true).messages_retried, 1);
    }

    #[test]
    fn test_zero_retry_interval_disables_retries() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let config = SessionConfig::new("client-a").with_retry_interval(Duration::ZERO);
        connected(&mut engine, &config, t0);
        engine
            .publish("client-a", "t", b"x", QoS::AtLeastOnce, false, t0)
            .unwrap();

        assert_eq!(engine.sweep(secs(t0, 50), true).messages_retried, 0);
    }

    #[test]
    fn test_retry_resends_every_due_entry_in_order() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let transport = connected(&mut engine, &retrying("client-a"), t0);
        for topic in ["a", "b", "c"] {
            engine
                .publish("client-a", topic, b"x", QoS::ExactlyOnce, false, t0)
                .unwrap();
        }
        engine
            .handle_packet("client-a", Packet::PubRec(PubRecPacket::new(2)), secs(t0, 4))
            .unwrap();
        transport.take_sent();

        let report = engine.sweep(secs(t0, 7), true);

        assert_eq!(report.messages_retried, 2);
        let sent = transport.take_sent();
        let ids: Vec<Option<u16>> = sent
            .iter()
            .map(|packet| match packet {
                Packet::Publish(publish) => publish.packet_id,
                other => panic!("unexpected packet {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![Some(1), Some(3)]);

        let report = engine.sweep(secs(t0, 10), true);
        assert_eq!(report.messages_retried, 1);
        assert_eq!(
            transport.take_sent(),
            vec![Packet::PubRel(PubRelPacket::new(2).with_dup(true))]
        );
    }

    #[test]
    fn test_keepalive_pings_when_due() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let config = SessionConfig::new("client-a").with_keep_alive(Duration::from_secs(30));
        let transport = connected(&mut engine, &config, t0);

        assert_eq!(engine.sweep(secs(t0, 20), true).pings_sent, 0);
        assert!(transport.take_sent().is_empty());

        let report = engine.sweep(secs(t0, 31), true);
        assert_eq!(report.pings_sent, 1);
        assert_eq!(transport.take_sent(), vec![Packet::PingReq]);
        let conn = engine.connection("client-a").unwrap();
        assert!(conn.ping_outstanding());
        assert_eq!(conn.last_contact(), secs(t0, 31));

        engine
            .handle_packet("client-a", Packet::PingResp, secs(t0, 32))
            .unwrap();
        assert!(!engine.connection("client-a").unwrap().ping_outstanding());
    }

    #[test]
    fn test_connecting_sessions_are_skipped() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let transport = RecordingTransport::new();
        let config = SessionConfig::new("client-a").with_keep_alive(Duration::from_secs(30));
        engine.connect(&config, transport.clone(), t0).unwrap();
        transport.take_sent();

        assert_eq!(engine.sweep(secs(t0, 100), true), SweepReport::default());
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn test_pending_writes_suppress_retries_and_holds() {
        let t0 = Instant::now();
        let mut engine = TestEngine::new(NoPersistence, RecordingSink::new());
        let transport = connected(&mut engine, &retrying("client-a"), t0);
        engine
            .publish("client-a", "t", b"x", QoS::AtLeastOnce, false, t0)
            .unwrap();
        transport.push_outcome(SendOutcome::Interrupted { written: 1 });
        engine
            .publish("client-a", "t", b"y", QoS::AtMostOnce, false, t0)
            .unwrap();
        transport.take_sent();

        let report = engine.sweep(secs(t0, 6), true);
        assert_eq!(report.messages_retried, 0);
        assert_eq!(report.holds_released, 0);
        assert_eq!(engine.publications().len(), 2);

        transport.set_pending(false);
        let report = engine.sweep(secs(t0, 7), true);
        assert_eq!(report.holds_released, 1);
        assert_eq!(report.messages_retried, 1);
        assert_eq!(engine.publications().len(), 1);
    }

    #[test]
    fn test_retry_failure_tears_down_and_continues() {
        let t0 = Instant::now();
        let sink = RecordingSink::new();
        let mut engine = TestEngine::new(NoPersistence, sink.clone());
        let failing = connected(
            &mut engine,
            &retrying("client-a").with_will(WillMessage::new("wills/a", "gone")),
            t0,
        );
        let healthy = connected(&mut engine, &retrying("client-b"), t0);
        for client_id in ["client-a", "client-b"] {
            engine
                .publish(client_id, "t", b"x", QoS::AtLeastOnce, false, t0)
                .unwrap();
        }
        failing.take_sent();
        healthy.take_sent();
        failing.push_outcome(SendOutcome::Error(MqttError::Io("reset".to_string())));

        let report = engine.sweep(secs(t0, 6), true);

        assert_eq!(report.sessions_closed, 1);
        assert_eq!(report.messages_retried, 1);
        assert!(engine.connection("client-a").is_none());
        assert!(engine.connection("client-b").is_some());
        assert_eq!(healthy.take_sent().len(), 1);
        assert_eq!(sink.wills().len(), 1);
        assert_eq!(engine.publications().len(), 1);
    }

    #[test]
    fn test_unhealthy_session_torn_down_with_will() {
        let t0 = Instant::now();
        let sink = RecordingSink::new();
        let mut engine = TestEngine::new(NoPersistence, sink.clone());
        let config = SessionConfig::new("client-a").with_will(WillMessage::new("wills/a", "gone"));
        connected(&mut engine, &config, t0);
        engine.connection_mut("client-a").unwrap().healthy = false;

        let report = engine.sweep(secs(t0, 1), true);

        assert_eq!(report.sessions_closed, 1);
        assert!(engine.is_empty());
        assert_eq!(sink.wills()[0].0, "client-a");
    }
}
