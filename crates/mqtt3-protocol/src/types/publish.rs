#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    QoS0,
    QoS1Or2 { packet_id: u16 },
}

impl PublishResult {
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::QoS0 => None,
            Self::QoS1Or2 { packet_id } => Some(*packet_id),
        }
    }
}
