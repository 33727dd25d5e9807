mod connect;
mod message;
mod publish;

pub use connect::{ConnectReturnCode, SessionConfig, DEFAULT_MIN_RETRY_INTERVAL};
pub use message::{Message, WillMessage};
pub use publish::PublishResult;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Strict conversion used by the decoder; QoS 3 is a malformed packet.
    pub fn try_from_bits(value: u8) -> crate::error::Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(crate::error::MqttError::InvalidQoS(other)),
        }
    }
}

impl From<u8> for QoS {
    fn from(value: u8) -> Self {
        match value {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}
