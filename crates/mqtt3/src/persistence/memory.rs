//! Volatile persistence, shared between engine instances in one process.

use super::{record_key, RecordKey};
use crate::error::Result;
use mqtt3_protocol::persistence::{InflightDirection, Persistence, PersistedMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Records {
    entries: HashMap<RecordKey, (u64, PersistedMessage)>,
    next_sequence: u64,
}

impl Records {
    fn upsert(&mut self, message: &PersistedMessage) {
        let key = record_key(message);
        let sequence = match self.entries.get(&key) {
            Some((sequence, _)) => *sequence,
            None => {
                self.next_sequence += 1;
                self.next_sequence
            }
        };
        self.entries.insert(key, (sequence, message.clone()));
    }
}

/// Keeps records in a process-wide map. Clones share the same records, so a
/// session restored by a second engine sees what the first one stored.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    records: Arc<Mutex<Records>>,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().entries.is_empty()
    }
}

impl Persistence for MemoryPersistence {
    fn on_enqueue_outbound(&mut self, message: &PersistedMessage) -> Result<()> {
        self.records.lock().upsert(message);
        Ok(())
    }

    fn on_enqueue_inbound(&mut self, message: &PersistedMessage) -> Result<()> {
        self.records.lock().upsert(message);
        Ok(())
    }

    fn on_complete(
        &mut self,
        client_id: &str,
        packet_id: u16,
        direction: InflightDirection,
    ) -> Result<()> {
        self.records
            .lock()
            .entries
            .remove(&(client_id.to_string(), direction, packet_id));
        Ok(())
    }

    fn restore(&mut self, client_id: &str) -> Result<Vec<PersistedMessage>> {
        let records = self.records.lock();
        let mut found: Vec<&(u64, PersistedMessage)> = records
            .entries
            .iter()
            .filter(|((owner, _, _), _)| owner == client_id)
            .map(|(_, entry)| entry)
            .collect();
        found.sort_by_key(|(sequence, _)| *sequence);
        debug!(client_id, count = found.len(), "Restoring from memory");
        Ok(found.into_iter().map(|(_, message)| message.clone()).collect())
    }

    fn clear(&mut self, client_id: &str) -> Result<()> {
        self.records
            .lock()
            .entries
            .retain(|(owner, _, _), _| owner != client_id);
        Ok(())
    }
}
