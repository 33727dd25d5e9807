use super::ack_common::define_ack_packet;
use crate::packet::PacketType;

define_ack_packet! {
    /// MQTT UNSUBACK packet
    pub struct UnsubAckPacket;
    packet_type = PacketType::UnsubAck;
    flags = 0x00;
    error_prefix = "UNSUBACK";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FixedHeader, MqttPacket};
    use bytes::BytesMut;

    #[test]
    fn test_unsuback_decode() {
        let mut buf = BytesMut::from(&[0xB0, 0x02, 0x00, 0x05][..]);
        let header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(
            UnsubAckPacket::decode_body(&mut buf, &header).unwrap(),
            UnsubAckPacket::new(5)
        );
    }
}
