use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::{SessionConfig, WillMessage};
use crate::QoS;
use bytes::{Buf, BufMut};

pub const PROTOCOL_NAME: &str = "MQIsdp";
pub const PROTOCOL_LEVEL: u8 = 3;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<WillMessage>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl core::fmt::Debug for ConnectPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectPacket")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("will", &self.will)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ConnectPacket {
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive_secs(),
            clean_session: config.clean_session,
            will: config.will.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
            // 3.1 only allows a password alongside a username
            if self.password.is_some() {
                flags |= FLAG_PASSWORD;
            }
        }
        if let Some(will) = &self.will {
            flags |= FLAG_WILL | ((will.qos as u8) << 3);
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        flags
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);

        encode_string(buf, &self.client_id)?;
        if let Some(will) = &self.will {
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }
        if let Some(username) = &self.username {
            encode_string(buf, username)?;
            if let Some(password) = &self.password {
                encode_string(buf, password)?;
            }
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let protocol_name = decode_string(buf)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(MqttError::ProtocolError(format!(
                "Unexpected protocol name {protocol_name}"
            )));
        }
        if buf.remaining() < 4 {
            return Err(MqttError::MalformedPacket(
                "CONNECT variable header truncated".to_string(),
            ));
        }
        let level = buf.get_u8();
        if level != PROTOCOL_LEVEL {
            return Err(MqttError::ProtocolError(format!(
                "Unsupported protocol level {level}"
            )));
        }
        let flags = buf.get_u8();
        let keep_alive = buf.get_u16();

        let client_id = decode_string(buf)?;
        let will = if flags & FLAG_WILL != 0 {
            let topic = decode_string(buf)?;
            let payload = decode_binary(buf)?;
            Some(WillMessage {
                topic,
                payload,
                qos: QoS::try_from_bits((flags >> 3) & 0x03)?,
                retain: flags & FLAG_WILL_RETAIN != 0,
            })
        } else {
            None
        };
        let username = if flags & FLAG_USERNAME != 0 {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if flags & FLAG_PASSWORD != 0 && buf.has_remaining() {
            Some(decode_string(buf)?)
        } else {
            None
        };

        Ok(Self {
            client_id,
            keep_alive,
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
            will,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;
    use bytes::BytesMut;

    #[test]
    fn test_minimal_connect_wire_format() {
        let config = SessionConfig::new("c1").with_keep_alive(Duration::from_secs(30));
        let mut buf = BytesMut::new();
        ConnectPacket::from_config(&config).encode(&mut buf).unwrap();

        let expected: &[u8] = &[
            0x10, 0x10, 0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00, 0x1E,
            0x00, 0x02, b'c', b'1',
        ];
        assert_eq!(&buf[..], expected);
    }

    #[test]
    fn test_connect_flags_with_will_and_credentials() {
        let config = SessionConfig::new("c")
            .with_clean_session(false)
            .with_credentials("user", "pass")
            .with_will(
                WillMessage::new("status", "gone")
                    .with_qos(QoS::ExactlyOnce)
                    .with_retain(true),
            );
        let packet = ConnectPacket::from_config(&config);
        assert_eq!(packet.connect_flags(), 0x80 | 0x40 | 0x20 | 0x10 | 0x04);
    }

    #[test]
    fn test_password_without_username_is_not_flagged() {
        let mut packet = ConnectPacket::from_config(&SessionConfig::new("c"));
        packet.password = Some("orphan".to_string());
        assert_eq!(packet.connect_flags() & FLAG_PASSWORD, 0);
    }

    #[test]
    fn test_connect_decode() {
        let config = SessionConfig::new("decoder")
            .with_credentials("u", "p")
            .with_will(WillMessage::new("w", vec![0u8, 1, 2]).with_qos(QoS::AtLeastOnce));
        let packet = ConnectPacket::from_config(&config);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();

        let header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = ConnectPacket::decode_body(&mut buf, &header).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_debug_redacts_password() {
        let packet = ConnectPacket::from_config(&SessionConfig::new("c").with_credentials("u", "secret"));
        assert!(!format!("{packet:?}").contains("secret"));
    }
}
