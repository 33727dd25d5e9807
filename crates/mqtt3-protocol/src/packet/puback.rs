use super::ack_common::define_ack_packet;
use crate::packet::PacketType;

define_ack_packet! {
    /// MQTT PUBACK packet (`QoS` 1 publish acknowledgment)
    pub struct PubAckPacket;
    packet_type = PacketType::PubAck;
    flags = 0x00;
    error_prefix = "PUBACK";
}
