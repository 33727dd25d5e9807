//! Packet reading loop for one TCP session.

use crate::engine::{now, SharedEngine};
use crate::error::MqttError;
use crate::transport::TcpTransport;
use bytes::BytesMut;
use mqtt3_protocol::persistence::Persistence;
use mqtt3_protocol::sink::MessageSink;
use mqtt3_protocol::{Packet, SessionEngine};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Whether `client_id` is still served by this socket. A reconnect under the
/// same id replaces the registry entry, and the old reader must leave it alone.
fn owns_session<P, S>(
    engine: &SessionEngine<TcpTransport, P, S>,
    client_id: &str,
    transport: &TcpTransport,
) -> bool
where
    P: Persistence,
    S: MessageSink,
{
    engine
        .connection(client_id)
        .is_some_and(|conn| conn.transport().same_socket(transport))
}

fn close_if_owned<P, S>(
    engine: &SharedEngine<TcpTransport, P, S>,
    client_id: &str,
    transport: &TcpTransport,
) where
    P: Persistence,
    S: MessageSink,
{
    let mut engine = engine.lock();
    if owns_session(&engine, client_id, transport) {
        if let Err(e) = engine.close_session(client_id, true) {
            debug!(client_id, "Session already closed: {e}");
        }
    }
}

/// Decodes frames off the socket and feeds them to the engine until the peer
/// goes away, a frame fails to decode, or the session is closed locally.
pub(crate) async fn read_loop<P, S>(
    mut reader: OwnedReadHalf,
    transport: TcpTransport,
    engine: SharedEngine<TcpTransport, P, S>,
    client_id: String,
) where
    P: Persistence,
    S: MessageSink,
{
    debug!(client_id = %client_id, "Packet reader started");
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        loop {
            match Packet::decode_frame(&mut buf) {
                Ok(Some(packet)) => {
                    trace!(client_id = %client_id, "Received packet: {:?}", packet);
                    let handled = {
                        let mut guard = engine.lock();
                        if !owns_session(&guard, &client_id, &transport) {
                            debug!(client_id = %client_id, "Session replaced, reader exiting");
                            return;
                        }
                        guard.handle_packet(&client_id, packet, now())
                    };
                    match handled {
                        Ok(()) => {}
                        Err(MqttError::UnknownSession(_)) => return,
                        Err(e) => {
                            warn!(client_id = %client_id, "Error handling packet: {e}");
                            close_if_owned(&engine, &client_id, &transport);
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(client_id = %client_id, "Malformed packet from peer: {e}");
                    close_if_owned(&engine, &client_id, &transport);
                    return;
                }
            }
        }

        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            () = transport.closed() => {
                debug!(client_id = %client_id, "Transport closed locally, reader exiting");
                return;
            }
        };

        match read {
            Ok(0) => {
                info!(client_id = %client_id, "Connection closed by peer");
                close_if_owned(&engine, &client_id, &transport);
                return;
            }
            Ok(n) => trace!(client_id = %client_id, bytes = n, "Read from socket"),
            Err(e) => {
                warn!(client_id = %client_id, "Error reading from socket: {e}");
                close_if_owned(&engine, &client_id, &transport);
                return;
            }
        }
    }
}
