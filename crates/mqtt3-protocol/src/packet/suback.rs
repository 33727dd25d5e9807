use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::QoS;
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// One granted `QoS` per requested filter, in request order.
    pub granted_qos: Vec<QoS>,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, granted_qos: Vec<QoS>) -> Self {
        Self {
            packet_id,
            granted_qos,
        }
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        for qos in &self.granted_qos {
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "SUBACK missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();
        let mut granted_qos = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            granted_qos.push(QoS::try_from_bits(buf.get_u8())?);
        }
        Ok(Self {
            packet_id,
            granted_qos,
        })
    }
}
