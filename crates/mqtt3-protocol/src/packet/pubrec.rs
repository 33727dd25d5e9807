use super::ack_common::define_ack_packet;
use crate::packet::PacketType;

define_ack_packet! {
    /// MQTT PUBREC packet (`QoS` 2 publish received, part 1)
    pub struct PubRecPacket;
    packet_type = PacketType::PubRec;
    flags = 0x00;
    error_prefix = "PUBREC";
}
