//! Persistence adapters for in-flight exchanges.

pub mod file;
pub mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;
pub use mqtt3_protocol::persistence::{
    InflightDirection, InflightPhase, NoPersistence, Persistence, PersistedMessage,
};

/// Key of one persisted exchange.
pub(crate) type RecordKey = (String, InflightDirection, u16);

pub(crate) fn record_key(message: &PersistedMessage) -> RecordKey {
    (
        message.client_id.clone(),
        message.direction,
        message.packet_id,
    )
}
