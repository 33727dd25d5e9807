use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::ConnectReturnCode;
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub return_code: ConnectReturnCode,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(return_code: ConnectReturnCode) -> Self {
        Self { return_code }
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(0);
        buf.put_u8(self.return_code as u8);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK body must be 2 bytes".to_string(),
            ));
        }
        // reserved byte in 3.1
        buf.advance(1);
        let return_code = ConnectReturnCode::try_from(buf.get_u8())?;
        Ok(Self { return_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_connack_encode_decode() {
        let mut buf = BytesMut::new();
        ConnAckPacket::new(ConnectReturnCode::NotAuthorized)
            .encode(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x20, 0x02, 0x00, 0x05]);

        let header = FixedHeader::decode(&mut buf).unwrap();
        let packet = ConnAckPacket::decode_body(&mut buf, &header).unwrap();
        assert_eq!(packet.return_code, ConnectReturnCode::NotAuthorized);
    }

    #[test]
    fn test_connack_truncated() {
        let mut buf = BytesMut::from(&[0x20, 0x01, 0x00][..]);
        let header = FixedHeader::decode(&mut buf).unwrap();
        assert!(ConnAckPacket::decode_body(&mut buf, &header).is_err());
    }
}
