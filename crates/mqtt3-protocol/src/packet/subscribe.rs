use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType, FLAG_DUP};
use crate::QoS;
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// SUBSCRIBE is sent with `QoS` 1 in the fixed header flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
    pub dup: bool,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            dup: false,
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push(TopicFilter::new(filter, qos));
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn flags(&self) -> u8 {
        if self.dup {
            0x02 | FLAG_DUP
        } else {
            0x02
        }
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            buf.put_u8(filter.qos as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(format!(
                    "SUBSCRIBE filter {filter} missing requested QoS"
                )));
            }
            let qos = QoS::try_from_bits(buf.get_u8())?;
            filters.push(TopicFilter { filter, qos });
        }

        Ok(Self {
            packet_id,
            filters,
            dup: fixed_header.dup(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_subscribe_wire_format() {
        let packet = SubscribePacket::new(10).add_filter("a/#", QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x82, 0x08, 0x00, 0x0A, 0x00, 0x03, b'a', b'/', b'#', 0x01]
        );
    }

    #[test]
    fn test_subscribe_multiple_filters_decode() {
        let packet = SubscribePacket::new(2)
            .add_filter("x", QoS::AtMostOnce)
            .add_filter("y/+", QoS::ExactlyOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();

        let header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(header.flags, 0x02);
        assert_eq!(SubscribePacket::decode_body(&mut buf, &header).unwrap(), packet);
    }

    #[test]
    fn test_subscribe_requires_filters() {
        let mut buf = BytesMut::new();
        assert!(SubscribePacket::new(1).encode(&mut buf).is_err());
    }
}
