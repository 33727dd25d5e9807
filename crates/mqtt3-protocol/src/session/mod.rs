pub mod inflight;

pub use inflight::{AwaitingAck, InFlightMessage, MessageTable};
