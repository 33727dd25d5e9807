//! Network transports for the session engine.

pub mod tcp;

pub use mqtt3_protocol::transport::{SendOutcome, Transport};
pub use tcp::TcpTransport;
