//! Connects to a broker, subscribes, publishes a few readings and prints
//! everything the engine reports.
//!
//! ```text
//! RUST_LOG=mqtt3=debug cargo run --example tcp_publisher -- 127.0.0.1:1883 ./mqtt3-state
//! ```

use mqtt3::{
    shared, spawn_sweep, ChannelSink, FilePersistence, MqttClient, QoS, SessionConfig,
    SessionEngine, SinkEvent, SweepSettings, WillMessage,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mqtt3=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:1883".to_string());
    let state_dir = args.next().unwrap_or_else(|| "./mqtt3-state".to_string());

    let persistence = FilePersistence::open(&state_dir).await?;
    let (sink, mut events) = ChannelSink::new();
    let engine = shared(SessionEngine::new(persistence, sink));
    let _sweep = spawn_sweep(&engine, SweepSettings::default());

    let config = SessionConfig::new("tcp-publisher")
        .with_clean_session(false)
        .with_keep_alive(Duration::from_secs(30))
        .with_will(WillMessage::new("status/tcp-publisher", "offline").with_retain(true));
    let client = MqttClient::connect(&engine, addr.as_str(), &config).await?;
    println!("Connecting to {addr} (state in {state_dir})");

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SinkEvent::Message { message, .. } => println!(
                    "← {} ({} bytes, {:?})",
                    message.topic,
                    message.payload.len(),
                    message.qos
                ),
                SinkEvent::Will { will, .. } => println!("✗ will published on {}", will.topic),
                SinkEvent::Session { event, .. } => println!("• {event:?}"),
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    client.subscribe(&[("readings/#", QoS::AtLeastOnce)])?;
    for (i, qos) in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce]
        .into_iter()
        .enumerate()
    {
        let payload = format!("reading {i}");
        let result = client.publish("readings/demo", payload.as_bytes(), qos, false)?;
        println!("→ readings/demo {qos:?} {result:?}");
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    println!("{} exchange(s) still in flight", client.in_flight());
    client.disconnect().await?;
    drop(engine);
    printer.await?;
    Ok(())
}
