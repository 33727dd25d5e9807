//! A single-session TCP client over a shared engine.
//!
//! `MqttClient` owns the socket tasks for one session: the packet reader and
//! the write flusher. Every operation goes through the engine lock, so several
//! clients can share one engine and one sweep task.
//!
//! The socket is released once the engine has closed the session and the
//! client handle is gone.

use crate::engine::{now, SharedEngine};
use crate::error::{MqttError, Result};
use crate::reader::read_loop;
use crate::transport::TcpTransport;
use mqtt3_protocol::persistence::Persistence;
use mqtt3_protocol::sink::MessageSink;
use mqtt3_protocol::transport::Transport;
use mqtt3_protocol::types::{PublishResult, QoS, SessionConfig};
use std::sync::Arc;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

pub struct MqttClient<P, S>
where
    P: Persistence + 'static,
    S: MessageSink + 'static,
{
    engine: SharedEngine<TcpTransport, P, S>,
    client_id: String,
    transport: TcpTransport,
    reader: JoinHandle<()>,
    flusher: JoinHandle<()>,
}

impl<P, S> MqttClient<P, S>
where
    P: Persistence + 'static,
    S: MessageSink + 'static,
{
    /// Opens a TCP connection, registers the session and sends CONNECT.
    ///
    /// Returns once CONNECT is handed to the socket. The CONNACK outcome
    /// arrives through the sink as a session event.
    pub async fn connect(
        engine: &SharedEngine<TcpTransport, P, S>,
        addr: impl ToSocketAddrs,
        config: &SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        if engine.lock().connection(&config.client_id).is_some() {
            return Err(MqttError::AlreadyConnected);
        }

        let (transport, reader) = TcpTransport::connect(addr).await?;
        info!(client_id = %config.client_id, peer = %transport.peer_description(), "TCP connection established");

        let flusher = transport.spawn_flusher({
            let engine = Arc::downgrade(engine);
            let client_id = config.client_id.clone();
            move || {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let result = engine.lock().write_completed(&client_id);
                if let Err(e) = result {
                    trace!(client_id = %client_id, "Drain notice for closed session: {e}");
                }
            }
        });

        if let Err(e) = engine.lock().connect(config, transport.clone(), now()) {
            flusher.abort();
            return Err(e);
        }

        let reader = tokio::spawn(read_loop(
            reader,
            transport.clone(),
            Arc::clone(engine),
            config.client_id.clone(),
        ));

        Ok(Self {
            engine: Arc::clone(engine),
            client_id: config.client_id.clone(),
            transport,
            reader,
            flusher,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// True once CONNACK accepted the session and until it closes.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.engine
            .lock()
            .connection(&self.client_id)
            .is_some_and(|conn| conn.is_connected() && conn.transport().same_socket(&self.transport))
    }

    /// Outbound `QoS` 1 and 2 exchanges still waiting for acknowledgement.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.engine
            .lock()
            .connection(&self.client_id)
            .map_or(0, |conn| conn.outbound().len())
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<PublishResult> {
        self.engine
            .lock()
            .publish(&self.client_id, topic, payload, qos, retain, now())
    }

    /// Sends SUBSCRIBE. Returns the packet identifier the SUBACK event will carry.
    pub fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<u16> {
        self.engine.lock().subscribe(&self.client_id, filters, now())
    }

    pub fn unsubscribe(&self, filters: &[&str]) -> Result<u16> {
        self.engine
            .lock()
            .unsubscribe(&self.client_id, filters, now())
    }

    /// Sends DISCONNECT, closes the session without its will and waits for
    /// the socket tasks to stop.
    pub async fn disconnect(self) -> Result<()> {
        let result = self.engine.lock().disconnect(&self.client_id, now());
        if result.is_err() {
            self.reader.abort();
            self.flusher.abort();
        }
        if let Err(e) = self.reader.await {
            debug!(client_id = %self.client_id, "Reader task ended abnormally: {e}");
        }
        if let Err(e) = self.flusher.await {
            debug!(client_id = %self.client_id, "Flusher task ended abnormally: {e}");
        }
        result
    }
}

impl<P, S> std::fmt::Debug for MqttClient<P, S>
where
    P: Persistence + 'static,
    S: MessageSink + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
