//! File-backed persistence with write-behind.
//!
//! Records live under `inflight/<client>/<direction>_<packet_id>.json`. The
//! engine calls into this adapter with its lock held, so the calls only update
//! an in-memory cache and queue the file operation; a background task performs
//! the writes atomically (temporary file, sync, rename).

use super::{record_key, RecordKey};
use crate::error::{MqttError, Result};
use mqtt3_protocol::persistence::{InflightDirection, Persistence, PersistedMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Bump only when the record layout or the directory scheme changes.
const STORAGE_VERSION: &str = "1";

#[derive(Debug)]
enum FileOp {
    Write(PersistedMessage),
    Remove {
        client_id: String,
        direction: InflightDirection,
        packet_id: u16,
    },
    RemoveClient(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct FilePersistence {
    base_dir: PathBuf,
    cache: Arc<Mutex<HashMap<RecordKey, PersistedMessage>>>,
    ops: mpsc::UnboundedSender<FileOp>,
}

impl FilePersistence {
    /// Opens (or creates) the store under `base_dir`, loads every record into
    /// the cache and starts the writer task.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        check_storage_version(&base_dir).await?;
        let inflight_dir = base_dir.join("inflight");
        fs::create_dir_all(&inflight_dir).await.map_err(|e| {
            MqttError::Configuration(format!(
                "Failed to create dir {}: {e}",
                inflight_dir.display()
            ))
        })?;

        let cache = load_records(&inflight_dir).await?;
        info!(
            records = cache.len(),
            "Opened file persistence at {}",
            base_dir.display()
        );

        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(inflight_dir, rx));

        Ok(Self {
            base_dir,
            cache: Arc::new(Mutex::new(cache)),
            ops,
        })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Waits until every operation queued so far has reached the disk.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue(FileOp::Flush(tx))?;
        rx.await
            .map_err(|_| MqttError::Persistence("file writer stopped".to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    fn queue(&self, op: FileOp) -> Result<()> {
        self.ops
            .send(op)
            .map_err(|_| MqttError::Persistence("file writer stopped".to_string()))
    }

    fn store(&self, message: &PersistedMessage) -> Result<()> {
        self.cache.lock().insert(record_key(message), message.clone());
        self.queue(FileOp::Write(message.clone()))
    }
}

impl Persistence for FilePersistence {
    fn on_enqueue_outbound(&mut self, message: &PersistedMessage) -> Result<()> {
        self.store(message)
    }

    fn on_enqueue_inbound(&mut self, message: &PersistedMessage) -> Result<()> {
        self.store(message)
    }

    fn on_complete(
        &mut self,
        client_id: &str,
        packet_id: u16,
        direction: InflightDirection,
    ) -> Result<()> {
        self.cache
            .lock()
            .remove(&(client_id.to_string(), direction, packet_id));
        self.queue(FileOp::Remove {
            client_id: client_id.to_string(),
            direction,
            packet_id,
        })
    }

    fn restore(&mut self, client_id: &str) -> Result<Vec<PersistedMessage>> {
        let mut records: Vec<PersistedMessage> = self
            .cache
            .lock()
            .iter()
            .filter(|((owner, _, _), _)| owner == client_id)
            .map(|(_, message)| message.clone())
            .collect();
        records.sort_by_key(|m| (m.sequence, m.direction, m.packet_id));
        debug!(client_id, count = records.len(), "Restoring from file cache");
        Ok(records)
    }

    fn clear(&mut self, client_id: &str) -> Result<()> {
        self.cache
            .lock()
            .retain(|(owner, _, _), _| owner != client_id);
        self.queue(FileOp::RemoveClient(client_id.to_string()))
    }
}

/// Client identifiers may hold characters that are not safe in file names.
fn client_to_dirname(client_id: &str) -> String {
    let mut result = String::with_capacity(client_id.len());
    for ch in client_id.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            result.push(ch);
        } else {
            let mut utf8 = [0u8; 4];
            for byte in ch.encode_utf8(&mut utf8).bytes() {
                result.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    result
}

fn record_filename(direction: InflightDirection, packet_id: u16) -> String {
    format!("{}_{packet_id}.json", direction.as_str())
}

async fn check_storage_version(base_dir: &Path) -> Result<()> {
    let version_file = base_dir.join(".storage_version");

    if fs::try_exists(&version_file).await.unwrap_or(false) {
        let stored = fs::read_to_string(&version_file).await.map_err(|e| {
            MqttError::Configuration(format!("Failed to read storage version: {e}"))
        })?;
        if stored.trim() != STORAGE_VERSION {
            return Err(MqttError::Configuration(format!(
                "Storage version mismatch in {}: found {}, expected {STORAGE_VERSION}",
                base_dir.display(),
                stored.trim()
            )));
        }
        debug!("Storage version verified: {STORAGE_VERSION}");
    } else {
        fs::create_dir_all(base_dir).await.map_err(|e| {
            MqttError::Configuration(format!("Failed to create storage dir: {e}"))
        })?;
        fs::write(&version_file, STORAGE_VERSION)
            .await
            .map_err(|e| {
                MqttError::Configuration(format!("Failed to write storage version: {e}"))
            })?;
        info!("Created new storage with version {STORAGE_VERSION}");
    }
    Ok(())
}

async fn load_records(inflight_dir: &Path) -> Result<HashMap<RecordKey, PersistedMessage>> {
    let mut records = HashMap::new();
    let mut clients = fs::read_dir(inflight_dir)
        .await
        .map_err(|e| MqttError::Io(format!("Failed to read {}: {e}", inflight_dir.display())))?;

    while let Some(client_dir) = clients
        .next_entry()
        .await
        .map_err(|e| MqttError::Io(format!("Failed to read directory entry: {e}")))?
    {
        let client_path = client_dir.path();
        let is_dir = fs::metadata(&client_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }

        let mut files = fs::read_dir(&client_path)
            .await
            .map_err(|e| MqttError::Io(format!("Failed to read {}: {e}", client_path.display())))?;
        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|e| MqttError::Io(format!("Failed to read directory entry: {e}")))?
        {
            let path = file.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let data = fs::read(&path)
                .await
                .map_err(|e| MqttError::Io(format!("Failed to read {}: {e}", path.display())))?;
            match serde_json::from_slice::<PersistedMessage>(&data) {
                Ok(message) => {
                    records.insert(record_key(&message), message);
                }
                Err(e) => warn!("Skipping unreadable record {}: {e}", path.display()),
            }
        }
    }
    Ok(records)
}

async fn write_file_atomic(path: &Path, message: &PersistedMessage) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MqttError::Io(format!("Failed to create parent directory: {e}")))?;
    }

    let serialized = serde_json::to_vec_pretty(message)
        .map_err(|e| MqttError::Persistence(format!("Failed to serialize record: {e}")))?;
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .await
        .map_err(|e| MqttError::Io(format!("Failed to create temp file: {e}")))?;
    file.write_all(&serialized)
        .await
        .map_err(|e| MqttError::Io(format!("Failed to write temp file: {e}")))?;
    file.flush()
        .await
        .map_err(|e| MqttError::Io(format!("Failed to flush temp file: {e}")))?;
    file.sync_data()
        .await
        .map_err(|e| MqttError::Io(format!("Failed to sync temp file: {e}")))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| MqttError::Io(format!("Failed to rename temp file: {e}")))
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MqttError::Io(format!(
            "Failed to remove {}: {e}",
            path.display()
        ))),
    }
}

async fn apply(inflight_dir: &Path, op: FileOp) -> Result<()> {
    match op {
        FileOp::Write(message) => {
            let path = inflight_dir
                .join(client_to_dirname(&message.client_id))
                .join(record_filename(message.direction, message.packet_id));
            write_file_atomic(&path, &message).await
        }
        FileOp::Remove {
            client_id,
            direction,
            packet_id,
        } => {
            let path = inflight_dir
                .join(client_to_dirname(&client_id))
                .join(record_filename(direction, packet_id));
            remove_if_present(&path).await
        }
        FileOp::RemoveClient(client_id) => {
            let dir = inflight_dir.join(client_to_dirname(&client_id));
            match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(MqttError::Io(format!(
                    "Failed to remove {}: {e}",
                    dir.display()
                ))),
            }
        }
        FileOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    }
}

async fn writer_task(inflight_dir: PathBuf, mut rx: mpsc::UnboundedReceiver<FileOp>) {
    while let Some(op) = rx.recv().await {
        if let Err(e) = apply(&inflight_dir, op).await {
            warn!("Failed to persist in-flight record: {e}");
        }
    }
    debug!("File persistence writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt3_protocol::persistence::InflightPhase;
    use mqtt3_protocol::QoS;
    use tempfile::TempDir;

    fn record(client_id: &str, packet_id: u16, direction: InflightDirection) -> PersistedMessage {
        PersistedMessage {
            client_id: client_id.to_string(),
            packet_id,
            direction,
            phase: InflightPhase::AwaitingPubrec,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: "plant/line-1".to_string(),
            payload: b"on".to_vec(),
            persisted_at_secs: 1_700_000_000,
            sequence: u64::from(packet_id),
        }
    }

    #[test]
    fn test_client_dirname_escapes_separators() {
        assert_eq!(client_to_dirname("sensor-1_a"), "sensor-1_a");
        assert_eq!(client_to_dirname("a/b"), "a%2Fb");
        assert_eq!(client_to_dirname("a.b"), "a%2Eb");
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let mut persistence = FilePersistence::open(dir.path()).await.unwrap();
        persistence
            .on_enqueue_outbound(&record("client/a", 1, InflightDirection::Outbound))
            .unwrap();
        persistence
            .on_enqueue_inbound(&record("client/a", 4, InflightDirection::Inbound))
            .unwrap();
        persistence.flush().await.unwrap();

        let expected = dir
            .path()
            .join("inflight")
            .join("client%2Fa")
            .join("outbound_1.json");
        assert!(expected.exists());

        let mut reopened = FilePersistence::open(dir.path()).await.unwrap();
        let restored = reopened.restore("client/a").unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0], record("client/a", 1, InflightDirection::Outbound));
        assert_eq!(restored[1].direction, InflightDirection::Inbound);
    }

    #[tokio::test]
    async fn test_restore_follows_enqueue_order_across_wrap() {
        let dir = TempDir::new().unwrap();
        let mut persistence = FilePersistence::open(dir.path()).await.unwrap();

        let mut oldest = record("c", 65535, InflightDirection::Outbound);
        oldest.sequence = 1;
        let mut newest = record("c", 1, InflightDirection::Outbound);
        newest.sequence = 2;
        persistence.on_enqueue_outbound(&oldest).unwrap();
        persistence.on_enqueue_outbound(&newest).unwrap();

        // PUBREC moves the older exchange on; its position must not change.
        oldest.phase = InflightPhase::AwaitingPubcomp;
        oldest.persisted_at_secs += 30;
        persistence.on_enqueue_outbound(&oldest).unwrap();
        persistence.flush().await.unwrap();

        let mut reopened = FilePersistence::open(dir.path()).await.unwrap();
        let ids: Vec<u16> = reopened
            .restore("c")
            .unwrap()
            .iter()
            .map(|m| m.packet_id)
            .collect();
        assert_eq!(ids, vec![65535, 1]);
    }

    #[tokio::test]
    async fn test_complete_and_clear_remove_files() {
        let dir = TempDir::new().unwrap();
        let mut persistence = FilePersistence::open(dir.path()).await.unwrap();
        for packet_id in 1..=3 {
            persistence
                .on_enqueue_outbound(&record("c", packet_id, InflightDirection::Outbound))
                .unwrap();
        }
        persistence
            .on_complete("c", 2, InflightDirection::Outbound)
            .unwrap();
        persistence.flush().await.unwrap();

        let client_dir = dir.path().join("inflight").join("c");
        assert!(client_dir.join("outbound_1.json").exists());
        assert!(!client_dir.join("outbound_2.json").exists());
        assert_eq!(persistence.len(), 2);

        persistence.clear("c").unwrap();
        persistence.flush().await.unwrap();
        assert!(!client_dir.exists());
        assert!(persistence.is_empty());

        let mut reopened = FilePersistence::open(dir.path()).await.unwrap();
        assert!(reopened.restore("c").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".storage_version"), "0").unwrap();
        let result = FilePersistence::open(dir.path()).await;
        assert!(matches!(result, Err(MqttError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unreadable_record_skipped() {
        let dir = TempDir::new().unwrap();
        FilePersistence::open(dir.path()).await.unwrap();
        let client_dir = dir.path().join("inflight").join("c");
        std::fs::create_dir_all(&client_dir).unwrap();
        std::fs::write(client_dir.join("outbound_1.json"), b"not json").unwrap();

        let mut reopened = FilePersistence::open(dir.path()).await.unwrap();
        assert!(reopened.restore("c").unwrap().is_empty());
    }
}
