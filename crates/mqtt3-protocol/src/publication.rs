//! Reference-counted storage for publish payloads.
//!
//! A publication is stored once and shared by every in-flight message that
//! refers to it. Topics are interned so identical topic strings share one
//! allocation. The store doubles as the tracking table used for accounting.

use crate::error::{MqttError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicationId(u64);

impl PublicationId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for PublicationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pub#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Publication {
    topic: Arc<str>,
    payload: Bytes,
    refcount: usize,
}

impl Publication {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Cheap clone of the stored payload; the transport can drain from it.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicationStats {
    pub live: usize,
    pub payload_bytes: usize,
    pub topics: usize,
}

#[derive(Debug, Default)]
pub struct PublicationStore {
    entries: HashMap<PublicationId, Publication>,
    topics: HashMap<Arc<str>, usize>,
    next_id: u64,
    payload_bytes: usize,
}

impl PublicationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `payload` into owned storage with a reference count of one.
    pub fn store(&mut self, topic: &str, payload: &[u8]) -> PublicationId {
        self.store_bytes(topic, Bytes::copy_from_slice(payload))
    }

    /// Stores an already-owned payload without copying it.
    pub fn store_bytes(&mut self, topic: &str, payload: Bytes) -> PublicationId {
        self.next_id += 1;
        let id = PublicationId(self.next_id);
        let topic = self.intern(topic);
        self.payload_bytes += payload.len();
        trace!(publication = %id, topic = %topic, len = payload.len(), "Stored publication");
        self.entries.insert(
            id,
            Publication {
                topic,
                payload,
                refcount: 1,
            },
        );
        id
    }

    pub fn acquire(&mut self, id: PublicationId) -> Result<()> {
        let publication = self
            .entries
            .get_mut(&id)
            .ok_or(MqttError::PublicationReleased(id.get()))?;
        publication.refcount += 1;
        Ok(())
    }

    /// Drops one reference. Returns `true` when that was the last one and the
    /// storage was freed.
    pub fn release(&mut self, id: PublicationId) -> Result<bool> {
        let publication = self
            .entries
            .get_mut(&id)
            .ok_or(MqttError::PublicationReleased(id.get()))?;
        publication.refcount -= 1;
        if publication.refcount > 0 {
            return Ok(false);
        }

        if let Some(freed) = self.entries.remove(&id) {
            self.payload_bytes -= freed.payload.len();
            self.untrack_topic(&freed.topic);
            trace!(publication = %id, "Freed publication");
        }
        Ok(true)
    }

    #[must_use]
    pub fn get(&self, id: PublicationId) -> Option<&Publication> {
        self.entries.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: PublicationId) -> bool {
        self.entries.contains_key(&id)
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
    pub fn stats(&self) -> PublicationStats {
        PublicationStats {
            live: self.entries.len(),
            payload_bytes: self.payload_bytes,
            topics: self.topics.len(),
        }
    }

    fn intern(&mut self, topic: &str) -> Arc<str> {
        let interned = match self.topics.get_key_value(topic) {
            Some((existing, _)) => Arc::clone(existing),
            None => Arc::from(topic),
        };
        *self.topics.entry(Arc::clone(&interned)).or_insert(0) += 1;
        interned
    }

    fn untrack_topic(&mut self, topic: &Arc<str>) {
        if let Some(count) = self.topics.get_mut(topic) {
            *count -= 1;
            if *count == 0 {
                self.topics.remove(topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_copies_payload() {
        let mut store = PublicationStore::new();
        let mut caller_buffer = b"hello".to_vec();
        let id = store.store("a/b", &caller_buffer);
        caller_buffer[0] = b'J';

        let publication = store.get(id).unwrap();
        assert_eq!(publication.topic(), "a/b");
        assert_eq!(&publication.payload()[..], b"hello");
        assert_eq!(publication.refcount(), 1);
    }

    #[test]
    fn test_release_frees_at_zero_only() {
        let mut store = PublicationStore::new();
        let id = store.store("t", b"x");
        store.acquire(id).unwrap();
        assert_eq!(store.get(id).unwrap().refcount(), 2);

        assert!(!store.release(id).unwrap());
        assert!(store.contains(id));
        assert!(store.release(id).unwrap());
        assert!(!store.contains(id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_double_release_is_an_error() {
        let mut store = PublicationStore::new();
        let id = store.store("t", b"x");
        assert!(store.release(id).unwrap());
        assert_eq!(
            store.release(id),
            Err(MqttError::PublicationReleased(id.get()))
        );
        assert_eq!(
            store.acquire(id),
            Err(MqttError::PublicationReleased(id.get()))
        );
    }

    #[test]
    fn test_identifiers_are_never_reused() {
        let mut store = PublicationStore::new();
        let first = store.store("t", b"1");
        store.release(first).unwrap();
        let second = store.store("t", b"2");
        assert_ne!(first, second);
    }

    #[test]
    fn test_topics_are_interned() {
        let mut store = PublicationStore::new();
        let a = store.store("shared/topic", b"1");
        let b = store.store("shared/topic", b"22");
        let c = store.store("other", b"333");

        let topic_a = Arc::clone(&store.get(a).unwrap().topic);
        let topic_b = Arc::clone(&store.get(b).unwrap().topic);
        assert!(Arc::ptr_eq(&topic_a, &topic_b));

        assert_eq!(
            store.stats(),
            PublicationStats {
                live: 3,
                payload_bytes: 6,
                topics: 2
            }
        );

        store.release(a).unwrap();
        store.release(c).unwrap();
        assert_eq!(
            store.stats(),
            PublicationStats {
                live: 1,
                payload_bytes: 2,
                topics: 1
            }
        );
        store.release(b).unwrap();
        assert_eq!(store.stats(), PublicationStats::default());
    }
}
