//! MQTT 3.1 control packets.
//!
//! Every packet is a fixed header byte (type in the high nibble, DUP/QoS/RETAIN
//! flags in the low nibble), a variable-length remaining-length field and a body.

pub mod ack_common;
pub mod connack;
pub mod connect;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

use crate::encoding::{
    decode_variable_int, encode_variable_int, peek_variable_int, variable_int_len,
};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, BytesMut};

pub use connack::ConnAckPacket;
pub use connect::ConnectPacket;
pub use puback::PubAckPacket;
pub use pubcomp::PubCompPacket;
pub use publish::PublishPacket;
pub use pubrec::PubRecPacket;
pub use pubrel::PubRelPacket;
pub use suback::SubAckPacket;
pub use subscribe::SubscribePacket;
pub use unsuback::UnsubAckPacket;
pub use unsubscribe::UnsubscribePacket;

pub const FLAG_DUP: u8 = 0x08;
pub const FLAG_RETAIN: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            other => return Err(MqttError::InvalidPacketType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    #[must_use]
    pub fn dup(&self) -> bool {
        self.flags & FLAG_DUP != 0
    }

    #[must_use]
    pub fn qos_bits(&self) -> u8 {
        (self.flags >> 1) & 0x03
    }

    #[must_use]
    pub fn retain(&self) -> bool {
        self.flags & FLAG_RETAIN != 0
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + variable_int_len(self.remaining_length)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        encode_variable_int(buf, self.remaining_length)
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing fixed header".to_string(),
            ));
        }
        let byte = buf.get_u8();
        let packet_type = PacketType::try_from(byte >> 4)?;
        let remaining_length = decode_variable_int(buf)?;
        Ok(Self {
            packet_type,
            flags: byte & 0x0F,
            remaining_length,
        })
    }
}

pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    fn flags(&self) -> u8 {
        0
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self>;

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        let remaining_length = u32::try_from(body.len()).map_err(|_| MqttError::PacketTooLarge {
            size: body.len(),
            max: crate::encoding::MAX_REMAINING_LENGTH as usize,
        })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PubAck(p) => p.encode(buf),
            Self::PubRec(p) => p.encode(buf),
            Self::PubRel(p) => p.encode(buf),
            Self::PubComp(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubAck(p) => p.encode(buf),
            Self::PingReq | Self::PingResp | Self::Disconnect => {
                FixedHeader::new(self.packet_type(), 0, 0).encode(buf)
            }
        }
    }

    pub fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        Ok(match fixed_header.packet_type {
            PacketType::Connect => {
                Self::Connect(Box::new(ConnectPacket::decode_body(buf, fixed_header)?))
            }
            PacketType::ConnAck => Self::ConnAck(ConnAckPacket::decode_body(buf, fixed_header)?),
            PacketType::Publish => Self::Publish(PublishPacket::decode_body(buf, fixed_header)?),
            PacketType::PubAck => Self::PubAck(PubAckPacket::decode_body(buf, fixed_header)?),
            PacketType::PubRec => Self::PubRec(PubRecPacket::decode_body(buf, fixed_header)?),
            PacketType::PubRel => Self::PubRel(PubRelPacket::decode_body(buf, fixed_header)?),
            PacketType::PubComp => Self::PubComp(PubCompPacket::decode_body(buf, fixed_header)?),
            PacketType::Subscribe => {
                Self::Subscribe(SubscribePacket::decode_body(buf, fixed_header)?)
            }
            PacketType::SubAck => Self::SubAck(SubAckPacket::decode_body(buf, fixed_header)?),
            PacketType::Unsubscribe => {
                Self::Unsubscribe(UnsubscribePacket::decode_body(buf, fixed_header)?)
            }
            PacketType::UnsubAck => {
                Self::UnsubAck(UnsubAckPacket::decode_body(buf, fixed_header)?)
            }
            PacketType::PingReq => Self::PingReq,
            PacketType::PingResp => Self::PingResp,
            PacketType::Disconnect => Self::Disconnect,
        })
    }

    /// Decodes one complete packet from the front of a read buffer.
    ///
    /// Returns `Ok(None)` and leaves the buffer untouched while the frame is
    /// still incomplete.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let Some((remaining_length, len_bytes)) = peek_variable_int(&buf[1..])? else {
            return Ok(None);
        };
        let total = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        let fixed_header = FixedHeader::decode(&mut frame)?;
        Self::decode_body(&mut frame, &fixed_header).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QoS;
    use bytes::Bytes;

    #[test]
    fn test_fixed_header_flags() {
        let header = FixedHeader::new(PacketType::Publish, 0x0D, 10);
        assert!(header.dup());
        assert_eq!(header.qos_bits(), 2);
        assert!(header.retain());
    }

    #[test]
    fn test_fixed_header_encode_decode() {
        let header = FixedHeader::new(PacketType::PubRel, 0x02, 2);
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x62, 0x02]);
        assert_eq!(header.encoded_len(), 2);

        let decoded = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_invalid_packet_type() {
        let mut buf = BytesMut::from(&[0xF0, 0x00][..]);
        assert_eq!(
            FixedHeader::decode(&mut buf),
            Err(MqttError::InvalidPacketType(15))
        );
    }

    #[test]
    fn test_pingreq_wire_format() {
        let mut buf = BytesMut::new();
        Packet::PingReq.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0xC0, 0x00]);
    }

    #[test]
    fn test_decode_frame_waits_for_complete_packet() {
        let mut full = BytesMut::new();
        Packet::Publish(
            PublishPacket::new("a/b", Bytes::from_static(b"hello"), QoS::AtLeastOnce)
                .with_packet_id(7),
        )
        .encode(&mut full)
        .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(Packet::decode_frame(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), full.len() - 1);

        partial.extend_from_slice(&full[full.len() - 1..]);
        let packet = Packet::decode_frame(&mut partial).unwrap().unwrap();
        assert!(partial.is_empty());
        match packet {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic_name, "a/b");
                assert_eq!(publish.packet_id, Some(7));
                assert_eq!(&publish.payload[..], b"hello");
            }
            other => panic!("Expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_back_to_back() {
        let mut buf = BytesMut::new();
        Packet::PingResp.encode(&mut buf).unwrap();
        Packet::PubAck(PubAckPacket::new(3)).encode(&mut buf).unwrap();

        assert_eq!(Packet::decode_frame(&mut buf).unwrap(), Some(Packet::PingResp));
        assert_eq!(
            Packet::decode_frame(&mut buf).unwrap(),
            Some(Packet::PubAck(PubAckPacket::new(3)))
        );
        assert_eq!(Packet::decode_frame(&mut buf).unwrap(), None);
    }
}
