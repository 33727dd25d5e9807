#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod packet_id;
pub mod persistence;
pub mod publication;
pub mod qos2;
pub mod session;
pub mod sink;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod time;
pub mod transport;
pub mod types;
pub mod validation;

pub use client::{Connection, ConnectionState, EngineStats, SessionEngine, SessionEvent, SweepReport};
pub use error::{MqttError, Result};
pub use packet::{FixedHeader, MqttPacket, Packet, PacketType};
pub use persistence::{InflightDirection, InflightPhase, NoPersistence, Persistence, PersistedMessage};
pub use publication::{Publication, PublicationId, PublicationStats, PublicationStore};
pub use sink::{DiscardSink, MessageSink};
pub use transport::{SendOutcome, Transport};
pub use types::{ConnectReturnCode, Message, PublishResult, QoS, SessionConfig, WillMessage};
pub use validation::{validate_client_id, validate_topic_filter, validate_topic_name};
