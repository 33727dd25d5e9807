use super::ack_common::define_ack_packet;
use crate::packet::PacketType;

define_ack_packet! {
    /// MQTT PUBCOMP packet (`QoS` 2 publish complete, part 3)
    pub struct PubCompPacket;
    packet_type = PacketType::PubComp;
    flags = 0x00;
    error_prefix = "PUBCOMP";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MqttPacket;
    use bytes::BytesMut;

    #[test]
    fn test_pubcomp_wire_format() {
        let mut buf = BytesMut::new();
        PubCompPacket::new(0xFFFF).encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x70, 0x02, 0xFF, 0xFF]);
    }
}
