use super::ack_common::define_ack_packet;
use crate::packet::PacketType;

define_ack_packet! {
    /// MQTT PUBREL packet (`QoS` 2 publish release, part 2)
    ///
    /// Sent with `QoS` 1 in the fixed header flags.
    pub struct PubRelPacket;
    packet_type = PacketType::PubRel;
    flags = 0x02;
    error_prefix = "PUBREL";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FixedHeader, MqttPacket};
    use bytes::BytesMut;

    #[test]
    fn test_pubrel_flags() {
        let mut buf = BytesMut::new();
        PubRelPacket::new(1).encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x62, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_pubrel_dup_is_preserved() {
        let mut buf = BytesMut::new();
        PubRelPacket::new(77).with_dup(true).encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x6A);

        let header = FixedHeader::decode(&mut buf).unwrap();
        let packet = PubRelPacket::decode_body(&mut buf, &header).unwrap();
        assert!(packet.dup);
        assert_eq!(packet.packet_id, 77);
    }
}
