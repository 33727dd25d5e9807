//! Non-blocking TCP transport.
//!
//! `send` never waits: whatever the socket does not take right away is queued
//! as `Bytes` handles and drained by a flusher task once the socket becomes
//! writable. The queued handles share the engine's stored payload.

use crate::error::{MqttError, Result};
use bytes::Bytes;
use mqtt3_protocol::transport::{SendOutcome, Transport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct WriteQueue {
    chunks: VecDeque<Bytes>,
    failure: Option<MqttError>,
}

impl WriteQueue {
    fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    fn queued_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

#[derive(Debug)]
struct Shared {
    writer: OwnedWriteHalf,
    queue: Mutex<WriteQueue>,
    notify: Notify,
    closed: AtomicBool,
    closed_notify: Notify,
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    shared: Arc<Shared>,
    peer: String,
}

impl TcpTransport {
    /// Connects and splits the stream. The read half goes to the packet reader.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<(Self, OwnedReadHalf)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MqttError::ConnectionError(format!("TCP connect failed: {e}")))?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<(Self, OwnedReadHalf)> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        let (reader, writer) = stream.into_split();
        debug!(peer = %peer, "TCP transport ready");
        let transport = Self {
            shared: Arc::new(Shared {
                writer,
                queue: Mutex::new(WriteQueue::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
            }),
            peer,
        };
        Ok((transport, reader))
    }

    /// Spawns the task that drains queued writes. `on_drained` runs, without
    /// any transport lock held, each time the queue empties.
    pub fn spawn_flusher<F>(&self, on_drained: F) -> JoinHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            flush_task(shared, &peer, on_drained).await;
        })
    }

    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.shared.queue.lock().queued_bytes()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called on any handle of this socket.
    pub async fn closed(&self) {
        wait_closed(&self.shared).await;
    }

    /// True when both handles write to the same socket.
    #[must_use]
    pub fn same_socket(&self, other: &TcpTransport) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, header: Bytes, payload: Bytes) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Error(MqttError::ConnectionError(
                "transport closed".to_string(),
            ));
        }

        let mut queue = self.shared.queue.lock();
        if let Some(failure) = &queue.failure {
            return SendOutcome::Error(failure.clone());
        }
        if !queue.chunks.is_empty() {
            queue.push(header);
            queue.push(payload);
            drop(queue);
            self.shared.notify.notify_one();
            return SendOutcome::Interrupted { written: 0 };
        }

        let total = header.len() + payload.len();
        let slices = [IoSlice::new(&header), IoSlice::new(&payload)];
        let written = match self.shared.writer.try_write_vectored(&slices) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                let error = MqttError::from(e);
                queue.failure = Some(error.clone());
                return SendOutcome::Error(error);
            }
        };
        if written == total {
            return SendOutcome::Complete;
        }

        if written < header.len() {
            queue.push(header.slice(written..));
            queue.push(payload);
        } else {
            queue.push(payload.slice(written - header.len()..));
        }
        drop(queue);
        trace!(peer = %self.peer, written, total, "Write interrupted, queued remainder");
        self.shared.notify.notify_one();
        SendOutcome::Interrupted { written }
    }

    fn has_pending_writes(&self) -> bool {
        !self.shared.queue.lock().chunks.is_empty()
    }

    fn peer_description(&self) -> String {
        self.peer.clone()
    }

    fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(peer = %self.peer, "Closing TCP transport");
            self.shared.notify.notify_one();
            self.shared.closed_notify.notify_waiters();
        }
    }
}

async fn wait_closed(shared: &Shared) {
    loop {
        let notified = shared.closed_notify.notified();
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

enum Drain {
    Empty,
    Blocked,
    Failed(MqttError),
}

fn drain_queue(shared: &Shared) -> Drain {
    let mut queue = shared.queue.lock();
    while let Some(chunk) = queue.chunks.front_mut() {
        match shared.writer.try_write(&chunk[..]) {
            Ok(0) => {
                let error = MqttError::Io("connection closed while writing".to_string());
                queue.failure = Some(error.clone());
                queue.chunks.clear();
                return Drain::Failed(error);
            }
            Ok(n) if n == chunk.len() => {
                queue.chunks.pop_front();
            }
            Ok(n) => {
                *chunk = chunk.slice(n..);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Blocked,
            Err(e) => {
                let error = MqttError::from(e);
                queue.failure = Some(error.clone());
                queue.chunks.clear();
                return Drain::Failed(error);
            }
        }
    }
    Drain::Empty
}

async fn flush_task<F: Fn()>(shared: Arc<Shared>, peer: &str, on_drained: F) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        if shared.queue.lock().chunks.is_empty() {
            shared.notify.notified().await;
            continue;
        }
        let writable = tokio::select! {
            writable = shared.writer.writable() => writable,
            () = wait_closed(&shared) => break,
        };
        if let Err(e) = writable {
            warn!(peer, "Socket no longer writable: {e}");
            shared.queue.lock().failure = Some(MqttError::from(e));
            break;
        }

        match drain_queue(&shared) {
            Drain::Empty => {
                trace!(peer, "Write queue drained");
                on_drained();
            }
            Drain::Blocked => {}
            Drain::Failed(e) => {
                warn!(peer, "Deferred write failed: {e}");
                break;
            }
        }
    }
    debug!(peer, "Flusher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use mqtt3_protocol::Packet;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, OwnedReadHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpTransport::connect(addr), listener.accept());
        let (transport, reader) = client.unwrap();
        (transport, reader, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_small_write_completes() {
        let (mut transport, _reader, mut server) = pair().await;

        let outcome = transport.send(Bytes::from_static(&[0xC0, 0x00]), Bytes::new());
        assert_eq!(outcome, SendOutcome::Complete);
        assert!(!transport.has_pending_writes());

        let mut buf = BytesMut::new();
        server.read_buf(&mut buf).await.unwrap();
        assert_eq!(Packet::decode_frame(&mut buf).unwrap(), Some(Packet::PingReq));
    }

    #[tokio::test]
    async fn test_large_write_drains_through_flusher() {
        let (mut transport, _reader, mut server) = pair().await;
        let drained = Arc::new(Notify::new());
        let signal = Arc::clone(&drained);
        let _flusher = transport.spawn_flusher(move || signal.notify_one());

        let payload = Bytes::from(vec![7u8; 8 * 1024 * 1024]);
        let outcome = transport.send(Bytes::from_static(b"head"), payload.clone());
        let total = 4 + payload.len();

        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            let mut chunk = vec![0u8; 64 * 1024];
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&received[..4], b"head");
        assert!(received[4..].iter().all(|b| *b == 7));

        if matches!(outcome, SendOutcome::Interrupted { .. }) {
            drained.notified().await;
        }
        assert!(!transport.has_pending_writes());
    }

    #[tokio::test]
    async fn test_close_stops_flusher_stuck_on_unread_socket() {
        let (mut transport, _reader, _server) = pair().await;
        let flusher = transport.spawn_flusher(|| {});

        let payload = Bytes::from(vec![1u8; 32 * 1024 * 1024]);
        let outcome = transport.send(Bytes::from_static(b"head"), payload);
        assert!(matches!(outcome, SendOutcome::Interrupted { .. }));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(transport.has_pending_writes());

        transport.close();
        tokio::time::timeout(std::time::Duration::from_secs(3), flusher)
            .await
            .expect("flusher ignored close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let (mut transport, _reader, _server) = pair().await;
        let watcher = transport.clone();
        let waiting = tokio::spawn(async move { watcher.closed().await });
        transport.close();
        assert!(transport.is_closed());
        waiting.await.unwrap();
        assert!(transport
            .send(Bytes::from_static(&[0xE0, 0x00]), Bytes::new())
            .is_error());
    }
}
