//! # MQTT 3.1 client sessions on Tokio
//!
//! Runs the sans-I/O session engine from `mqtt3-protocol` over TCP:
//! - a non-blocking transport that queues partial writes and drains them from
//!   a flusher task
//! - one packet reader task per session
//! - a sweep task driving keep-alive and retransmission
//! - memory and file persistence for in-flight exchanges
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqtt3::{shared, spawn_sweep, ChannelSink, MqttClient, NoPersistence, QoS, SessionConfig,
//!     SessionEngine, SinkEvent, SweepSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sink, mut events) = ChannelSink::new();
//!     let engine = shared(SessionEngine::new(NoPersistence, sink));
//!     let _sweep = spawn_sweep(&engine, SweepSettings::default());
//!
//!     let client = MqttClient::connect(&engine, "127.0.0.1:1883", &SessionConfig::new("sensor-1")).await?;
//!     client.subscribe(&[("sensors/+/temp", QoS::AtLeastOnce)])?;
//!     client.publish("sensors/1/temp", b"21.5", QoS::ExactlyOnce, false)?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SinkEvent::Message { message, .. } = event {
//!             println!("{}: {:?}", message.topic, message.payload);
//!         }
//!     }
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub use mqtt3_protocol::{
    encoding, error, keepalive, packet, packet_id, publication, qos2, session, time, types,
    validation,
};

pub mod client;
pub mod engine;
pub mod persistence;
mod reader;
pub mod sink;
pub mod transport;

pub use client::MqttClient;
pub use engine::{shared, spawn_sweep, SharedEngine, SweepSettings};
pub use mqtt3_protocol::{
    validate_client_id, validate_topic_filter, validate_topic_name, ConnectReturnCode, Connection,
    ConnectionState, EngineStats, Message, MqttError, NoPersistence, Packet, PublicationId,
    PublishResult, QoS, Result, SessionConfig, SessionEngine, SessionEvent, SweepReport,
    WillMessage,
};
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use sink::{ChannelSink, DiscardSink, MessageSink, SinkEvent};
pub use transport::{TcpTransport, Transport};
