use crate::types::{ConnectReturnCode, QoS};

/// Session milestones reported to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    ConnectionRefused(ConnectReturnCode),
    Subscribed {
        packet_id: u16,
        granted_qos: Vec<QoS>,
    },
    Unsubscribed {
        packet_id: u16,
    },
    /// An outbound `QoS` 1 or 2 publish was fully acknowledged.
    PublishComplete {
        packet_id: u16,
        qos: QoS,
    },
    Closed {
        will_sent: bool,
    },
}
