use crate::encoding::{decode_string, encode_string, string_len};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType, FLAG_DUP, FLAG_RETAIN};
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Present for `QoS` 1 and 2 only.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl PublishPacket {
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        self.packet_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    fn variable_header_len(&self) -> usize {
        string_len(&self.topic_name) + if self.qos == QoS::AtMostOnce { 0 } else { 2 }
    }

    fn encode_variable_header<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, &self.topic_name)?;
        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.ok_or_else(|| {
                MqttError::ProtocolError(format!(
                    "PUBLISH with QoS {} requires a packet identifier",
                    self.qos as u8
                ))
            })?;
            buf.put_u16(packet_id);
        }
        Ok(())
    }

    /// Writes the fixed header and variable header only.
    ///
    /// The remaining length still accounts for the payload, so the caller can
    /// hand the payload to the transport as a separate buffer without copying it.
    pub fn encode_header<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let total = self.variable_header_len() + self.payload.len();
        let remaining_length = u32::try_from(total).map_err(|_| MqttError::PacketTooLarge {
            size: total,
            max: crate::encoding::MAX_REMAINING_LENGTH as usize,
        })?;
        FixedHeader::new(PacketType::Publish, self.flags(), remaining_length).encode(buf)?;
        self.encode_variable_header(buf)
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= FLAG_DUP;
        }
        if self.retain {
            flags |= FLAG_RETAIN;
        }
        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        self.encode_variable_header(buf)?;
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self> {
        let qos = QoS::try_from_bits(fixed_header.qos_bits())?;
        let topic_name = decode_string(buf)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(MqttError::MalformedPacket(
                    "PUBLISH missing packet identifier".to_string(),
                ));
            }
            Some(buf.get_u16())
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain: fixed_header.retain(),
            dup: fixed_header.dup(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_publish_qos0_wire_format() {
        let packet = PublishPacket::new("a/b", Bytes::from_static(b"hi"), QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']);
    }

    #[test]
    fn test_publish_flags() {
        let packet = PublishPacket::new("t", Bytes::new(), QoS::ExactlyOnce)
            .with_packet_id(1)
            .with_retain(true)
            .with_dup(true);
        assert_eq!(packet.flags(), 0x0D);
    }

    #[test]
    fn test_publish_qos1_decode() {
        let packet = PublishPacket::new("sensors/t", Bytes::from_static(b"21.5"), QoS::AtLeastOnce)
            .with_packet_id(300)
            .with_retain(true);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();

        let header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = PublishPacket::decode_body(&mut buf, &header).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_publish_requires_packet_id_above_qos0() {
        let packet = PublishPacket::new("t", Bytes::new(), QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        assert!(matches!(
            packet.encode(&mut buf),
            Err(MqttError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_encode_header_matches_full_encoding() {
        let packet = PublishPacket::new("x/y", Bytes::from_static(b"payload"), QoS::ExactlyOnce)
            .with_packet_id(9);

        let mut full = BytesMut::new();
        packet.encode(&mut full).unwrap();

        let mut split = BytesMut::new();
        packet.encode_header(&mut split).unwrap();
        split.extend_from_slice(&packet.payload);

        assert_eq!(full, split);
    }

    #[test]
    fn test_publish_rejects_qos3() {
        let mut buf = BytesMut::from(&[0x36, 0x03, 0x00, 0x01, b't'][..]);
        let header = FixedHeader::decode(&mut buf).unwrap();
        assert_eq!(
            PublishPacket::decode_body(&mut buf, &header),
            Err(MqttError::InvalidQoS(3))
        );
    }
}
