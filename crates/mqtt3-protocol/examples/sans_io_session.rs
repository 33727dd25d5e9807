use bytes::{Bytes, BytesMut};
use mqtt3_protocol::packet::{
    ConnAckPacket, PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket,
};
use mqtt3_protocol::{
    ConnectReturnCode, Message, MessageSink, NoPersistence, Packet, QoS, SendOutcome,
    SessionConfig, SessionEngine, Transport,
};
use std::time::{Duration, Instant};

/// Collects written frames instead of touching a socket.
#[derive(Debug, Default)]
struct Wire {
    written: BytesMut,
}

impl Wire {
    fn take_packets(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(Some(packet)) = Packet::decode_frame(&mut self.written) {
            packets.push(packet);
        }
        packets
    }
}

impl Transport for Wire {
    fn send(&mut self, header: Bytes, payload: Bytes) -> SendOutcome {
        self.written.extend_from_slice(&header);
        self.written.extend_from_slice(&payload);
        SendOutcome::Complete
    }

    fn has_pending_writes(&self) -> bool {
        false
    }

    fn peer_description(&self) -> String {
        "in-memory".to_string()
    }

    fn close(&mut self) {
        self.written.clear();
    }
}

fn main() {
    println!("Sans-io MQTT 3.1 Session Example");
    println!("================================\n");

    let sink = |client_id: &str, message: Message| {
        let topic = &message.topic;
        let payload_len = message.payload.len();
        println!("     → Delivered to {client_id}: topic={topic}, payload={payload_len} bytes");
    };
    let mut engine = SessionEngine::new(NoPersistence, sink);
    let t0 = Instant::now();
    let config = SessionConfig::new("embedded-device-001")
        .with_keep_alive(Duration::from_secs(30))
        .with_retry_interval(Duration::from_secs(5))
        .with_min_retry_interval(Duration::from_secs(1));

    println!("1. Connecting...");
    engine.connect(&config, Wire::default(), t0).expect("connect");
    print_wire(&mut engine, "Connect");

    println!("\n2. Simulating CONNACK from broker...");
    feed(
        &mut engine,
        Packet::ConnAck(ConnAckPacket::new(ConnectReturnCode::Accepted)),
        t0,
    );
    let connected = engine
        .connection("embedded-device-001")
        .is_some_and(|conn| conn.is_connected());
    assert!(connected);
    println!("   ✓ Session is connected");

    println!("\n3. Subscribing...");
    engine
        .subscribe(
            "embedded-device-001",
            &[
                ("sensors/temperature", QoS::AtLeastOnce),
                ("sensors/humidity", QoS::AtMostOnce),
            ],
            t0,
        )
        .expect("subscribe");
    print_wire(&mut engine, "Subscribe");

    println!("\n4. Publishing QoS 1 and QoS 2...");
    let qos1 = engine
        .publish("embedded-device-001", "actuators/led", b"ON", QoS::AtLeastOnce, false, t0)
        .expect("publish");
    let qos2 = engine
        .publish("embedded-device-001", "actuators/valve", b"OPEN", QoS::ExactlyOnce, false, t0)
        .expect("publish");
    print_wire(&mut engine, "Publish");

    println!("\n5. Sweep after 6s: nothing acknowledged yet, both are resent with DUP...");
    let report = engine.sweep(t0 + Duration::from_secs(6), true);
    println!("   {report:?}");
    print_wire(&mut engine, "Retry");

    println!("\n6. Broker acknowledges...");
    let t7 = t0 + Duration::from_secs(7);
    if let Some(id) = qos1.packet_id() {
        feed(&mut engine, Packet::PubAck(PubAckPacket::new(id)), t7);
    }
    if let Some(id) = qos2.packet_id() {
        feed(&mut engine, Packet::PubRec(PubRecPacket::new(id)), t7);
        print_wire(&mut engine, "PUBREC handling");
        feed(&mut engine, Packet::PubComp(PubCompPacket::new(id)), t7);
    }

    println!("\n7. Incoming QoS 2 PUBLISH, duplicated by the broker...");
    let incoming = PublishPacket::new("sensors/temperature", &b"25.5"[..], QoS::ExactlyOnce)
        .with_packet_id(42);
    feed(&mut engine, Packet::Publish(incoming.clone()), t7);
    feed(&mut engine, Packet::Publish(incoming.with_dup(true)), t7);
    feed(&mut engine, Packet::PubRel(PubRelPacket::new(42)), t7);
    print_wire(&mut engine, "Incoming QoS 2");

    println!("\n8. Keep-alive sweep at 40s...");
    let report = engine.sweep(t0 + Duration::from_secs(40), false);
    println!("   {report:?}");
    print_wire(&mut engine, "Keep-alive");

    println!("\n9. Disconnecting...");
    engine.disconnect("embedded-device-001", t7).expect("disconnect");
    assert!(engine.is_empty());
    assert!(engine.publications().is_empty());
    println!("   ✓ Session closed, every publication released");

    let stats = engine.stats();
    println!("\n================================");
    println!("sent={} received={}", stats.messages_sent, stats.messages_received);
    println!("- SessionEngine never does I/O; the Transport receives encoded frames");
    println!("- Time is passed in, so retries and keep-alive are driven by sweep()");
}

fn feed<S: MessageSink>(
    engine: &mut SessionEngine<Wire, NoPersistence, S>,
    packet: Packet,
    now: Instant,
) {
    let name = packet.packet_type().name();
    println!("   ← {name}");
    engine
        .handle_packet("embedded-device-001", packet, now)
        .expect("handle packet");
}

fn print_wire<S: MessageSink>(engine: &mut SessionEngine<Wire, NoPersistence, S>, context: &str) {
    let Some(conn) = engine.connection_mut("embedded-device-001") else {
        return;
    };
    let packets = conn.transport_mut().take_packets();
    let len = packets.len();
    println!("   {context} wrote {len} packet(s):");
    for packet in packets {
        match &packet {
            Packet::Publish(publish) => println!(
                "     → PUBLISH(topic={}, id={:?}, dup={})",
                publish.topic_name, publish.packet_id, publish.dup
            ),
            other => println!("     → {}", other.packet_type().name()),
        }
    }
}
